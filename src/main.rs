use std::path::PathBuf;

use trafficcam_lib::{CliOptions, EXIT_CONFIG};

const USAGE: &str = "usage: trafficcam [--config <path>] [--check-config]";

fn main() {
    let mut cli = CliOptions::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(path) => cli.config_path = PathBuf::from(path),
                None => {
                    eprintln!("--config needs a path\n{}", USAGE);
                    std::process::exit(EXIT_CONFIG);
                }
            },
            "--check-config" => cli.check_config = true,
            "--help" | "-h" => {
                println!("{}", USAGE);
                return;
            }
            other => {
                eprintln!("unknown argument: {}\n{}", other, USAGE);
                std::process::exit(EXIT_CONFIG);
            }
        }
    }

    std::process::exit(trafficcam_lib::run(cli))
}
