//
// main.rs
//
// Entry point of the julia-testitems server
//

use std::env;
use std::path::PathBuf;

use julia_testitems::config::{load_settings_file, TestItemsConfig};
use julia_testitems::host;

fn print_usage() {
    println!(
        "julia-testitems {}, a test item runner for Julia packages.",
        env!("CARGO_PKG_VERSION")
    );
    print!(
        r#"
Usage: julia-testitems [OPTIONS]

Available options:

--stdio                      Start the server using stdio transport
--settings <FILE>            Read settings from a JSON file
--julia <PATH>               Julia executable used to run test items
--testrunner <DIR>           Julia environment containing runtestitem.jl
--version                    Print the version
--help                       Print this help message

"#
    );
}

fn option_value(argv: &mut env::Args, flag: &str) -> anyhow::Result<String> {
    argv.next()
        .ok_or_else(|| anyhow::anyhow!("Missing value for '{flag}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut argv = env::args();
    argv.next(); // skip executable name

    let mut use_stdio = false;
    let mut settings_file: Option<PathBuf> = None;
    let mut julia: Option<PathBuf> = None;
    let mut testrunner: Option<PathBuf> = None;

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--stdio" => use_stdio = true,
            "--settings" => settings_file = Some(option_value(&mut argv, &arg)?.into()),
            "--julia" => julia = Some(option_value(&mut argv, &arg)?.into()),
            "--testrunner" => testrunner = Some(option_value(&mut argv, &arg)?.into()),
            "--version" => {
                println!("julia-testitems {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_usage();
                return Ok(());
            }
            other => {
                return Err(anyhow::anyhow!("Unknown argument: '{other}'"));
            }
        }
    }

    if !use_stdio {
        print_usage();
        return Ok(());
    }

    env_logger::init();

    let mut config = match settings_file {
        Some(path) => load_settings_file(&path, TestItemsConfig::default())?,
        None => TestItemsConfig::default(),
    };
    // Command line flags take precedence over the settings file
    if let Some(julia) = julia {
        config.julia_executable = julia;
    }
    if let Some(testrunner) = testrunner {
        config.testrunner_dir = Some(testrunner);
    }

    host::start_lsp(config).await
}
