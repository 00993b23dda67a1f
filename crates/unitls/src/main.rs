//
// main.rs
//
// Command-line entry point: parses flags and serves one client over stdio
//

use std::env;
use std::sync::Arc;

use unitls::config::{DispatchMode, ServerOptions};
use unitls::loader::DirectoryLoaderFactory;
use unitls::service::GraphService;
use unitls::{transport, Session};

fn print_usage() {
    println!("unitls {}, a code-intelligence server core.", env!("CARGO_PKG_VERSION"));
    print!(
        r#"
Usage: unitls [OPTIONS]

Available options:

--stdio                      Start the server using stdio transport
--serial                     Handle every message to completion before reading the next
--trace-cache                Log every global cache mutation at debug level
--ext <EXTENSION>            Source file extension picked up by the loader (default: go)
--version                    Print the version
--help                       Print this help message

Logging is controlled with RUST_LOG (for example RUST_LOG=unitls=debug).

"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut argv = env::args();
    argv.next(); // skip executable name

    let mut use_stdio = false;
    let mut options = ServerOptions::default();

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--stdio" => use_stdio = true,
            "--serial" => options.dispatch_mode = DispatchMode::Serial,
            "--trace-cache" => options.trace_cache = true,
            "--ext" => match argv.next() {
                Some(ext) if !ext.is_empty() => options.source_extension = ext,
                _ => return Err(anyhow::anyhow!("--ext requires a file extension")),
            },
            "--version" => {
                println!("unitls {}", env!("CARGO_PKG_VERSION"));
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
    log::info!(
        "Starting unitls {} ({:?} dispatch, *.{} sources)",
        env!("CARGO_PKG_VERSION"),
        options.dispatch_mode,
        options.source_extension
    );

    let loaders = Arc::new(DirectoryLoaderFactory::new(options.source_extension.clone()));
    let session = Arc::new(Session::new(options, loaders));
    let service = Arc::new(GraphService::new());

    transport::serve(tokio::io::stdin(), tokio::io::stdout(), session, service).await
}
