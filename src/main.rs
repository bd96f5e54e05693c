use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use clap::Parser;
use tracing::{error, info};

use ecfand::ec::{self, EcKind, EmbeddedController};
use ecfand::error::{Error, Result};
use ecfand::model_config::ModelConfig;
use ecfand::sensors::SensorRegistry;
use ecfand::server::Server;
use ecfand::service::{self, Service};
use ecfand::service_config::ServiceConfig;

/// Notebook fan control daemon driving the embedded controller.
#[derive(Parser, Debug)]
#[command(name = "ecfand", version)]
struct Args {
    /// Path of the service config file
    #[arg(long, default_value = ecfand::SERVICE_CONFIG_PATH)]
    config_file: PathBuf,

    /// Directory containing per-model configs
    #[arg(long, default_value = ecfand::MODEL_CONFIGS_DIR)]
    configs_dir: PathBuf,

    /// Path of the IPC socket
    #[arg(long, default_value = ecfand::SOCKET_PATH)]
    socket: PathBuf,

    /// Embedded controller backend (ec_sys, acpi_ec, dev_port, dummy)
    #[arg(long, value_parser = parse_ec_kind)]
    embedded_controller: Option<EcKind>,

    /// Log every EC register operation
    #[arg(long)]
    debug: bool,

    /// Track state but never write to the EC
    #[arg(long)]
    read_only: bool,
}

fn parse_ec_kind(s: &str) -> std::result::Result<EcKind, String> {
    s.parse()
}

static QUIT: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: libc::c_int) {
    QUIT.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
        // Worker threads write replies to sockets the client may have
        // already closed.
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e.chain());
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let service_config = ServiceConfig::load(&args.config_file)?;
    info!(
        config = service_config.selected_config_id.as_str(),
        "using model config"
    );
    let model_path = args
        .configs_dir
        .join(format!("{}.json", service_config.selected_config_id));
    let model_config = ModelConfig::from_file(&model_path)?;

    // The command line wins over the service config; without either,
    // probe for the first backend that opens.
    let requested = args
        .embedded_controller
        .or(service_config.embedded_controller_type);
    if requested != Some(EcKind::Dummy) && unsafe { libc::geteuid() } != 0 {
        return Err(Error::Config(
            "this daemon must run as root to access the embedded controller".to_string(),
        ));
    }
    let (kind, ec) = match requested {
        Some(kind) => {
            let mut ec = ec::controller_for(kind);
            ec.open()?;
            (kind, ec)
        }
        None => ec::find_working()?,
    };
    info!(%kind, "embedded controller type");
    let ec: Box<dyn EmbeddedController> = if args.debug {
        Box::new(ec::TraceEc::new(ec))
    } else {
        ec
    };

    let sensors = SensorRegistry::discover()?;
    install_signal_handlers();

    let service = Service::new(
        model_config,
        service_config,
        ec,
        sensors,
        args.read_only,
        args.config_file.clone(),
    )?;
    let service = Arc::new(Mutex::new(service));

    let server = Arc::new(Server::bind(&args.socket)?);
    let acceptor = {
        let server = Arc::clone(&server);
        let service = Arc::clone(&service);
        thread::spawn(move || server.run(service, &QUIT))
    };

    let result = service::run(&service, &QUIT);

    QUIT.store(true, Ordering::SeqCst);
    server.shutdown();
    let _ = acceptor.join();
    service.lock().unwrap().shutdown();
    info!("shut down");
    result
}
