use camera_httpd::camera::{self, ServeArgs, ServerConfig, telemetry};
use clap::Parser;

/// Serve JPEG stills, an MJPEG stream and GPIO control over HTTP.
#[derive(Parser)]
#[command(name = "camera-httpd", version)]
struct Cli {
    #[command(flatten)]
    serve: ServeArgs,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    telemetry::init_tracing()?;
    telemetry::init_metrics_recorder()?;
    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli.serve)?;
    camera::run(config)
}
