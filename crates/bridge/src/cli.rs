use std::path::PathBuf;

use anyhow::Context;

pub(crate) struct Args {
    pub config_path: PathBuf,
    pub server_id: String,
    pub signaling_url: Option<String>,
    pub token: Option<String>,
    pub log_json: bool,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = PathBuf::from("./config/tether.toml");
    let mut server_id = None;
    let mut signaling_url = None;
    let mut log_json = false;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("tether {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("tether - reach a remote server over a WebRTC bridge");
                println!();
                println!("USAGE:");
                println!("    tether --server-id <ID> [OPTIONS]");
                println!();
                println!("Lines read from stdin are sent on the control channel.");
                println!();
                println!("OPTIONS:");
                println!(
                    "    -c, --config <PATH>          Config file [default: ./config/tether.toml]"
                );
                println!("    --server-id <ID>             Remote server to connect to (required)");
                println!("    --signaling-url <URL>        Override signaling.url from the config");
                println!("    --log-json                   Log as JSON lines");
                println!("    -V, --version                Print version and exit");
                println!("    -h, --help                   Print this help and exit");
                println!();
                println!("ENVIRONMENT:");
                println!("    TETHER_TOKEN                 Signaling auth token (overrides config)");
                println!("    RUST_LOG                     Log filter [default: info]");
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                config_path = PathBuf::from(args.get(i).context("Missing --config value")?);
            }
            "--server-id" => {
                i += 1;
                server_id = Some(args.get(i).context("Missing --server-id value")?.clone());
            }
            "--signaling-url" => {
                i += 1;
                signaling_url = Some(
                    args.get(i)
                        .context("Missing --signaling-url value")?
                        .clone(),
                );
            }
            "--log-json" => log_json = true,
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    // Token only via env; CLI args are visible in /proc
    let token = std::env::var("TETHER_TOKEN").ok().filter(|t| !t.is_empty());

    Ok(Args {
        config_path,
        server_id: server_id.context("--server-id is required")?,
        signaling_url,
        token,
        log_json,
    })
}
