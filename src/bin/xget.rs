//! Thin command-line front-end over the `xget` fetch engine.
//!
//! This binary is deliberately minimal: argument parsing, progress-bar
//! rendering, file-path derivation, MIME sniffing, and terminal detection
//! are all out of scope for the core engine (see crate docs) and are
//! sketched here only far enough to exercise the library end to end.
//!
//! # Usage
//! ```bash
//! xget <url> [-o output] [-c chunks] [--hash sha256]
//! ```

use std::env;
use std::process::ExitCode;
use tracing::{error, info, warn};
use xget::{Xget, XgetError, XgetEvent, XgetOptions};

struct Args {
    url: String,
    output: Option<String>,
    chunks: Option<u32>,
    hash: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut iter = env::args().skip(1);
    let mut url = None;
    let mut output = None;
    let mut chunks = None;
    let mut hash = None;

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-o" | "--output" => {
                output = Some(iter.next().ok_or("-o requires a value")?);
            }
            "-c" | "--chunks" => {
                let value = iter.next().ok_or("-c requires a value")?;
                chunks = Some(value.parse().map_err(|_| "invalid --chunks value")?);
            }
            "--hash" => {
                hash = Some(iter.next().ok_or("--hash requires a value")?);
            }
            other if url.is_none() => url = Some(other.to_string()),
            other => return Err(format!("unexpected argument: {other}")),
        }
    }

    Ok(Args {
        url: url.ok_or("missing <url> argument")?,
        output,
        chunks,
        hash,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("xget: {msg}");
            eprintln!("usage: xget <url> [-o output] [-c chunks] [--hash sha256|sha1|md5]");
            return ExitCode::FAILURE;
        }
    };

    let mut options = XgetOptions::default();
    if let Some(chunks) = args.chunks {
        options.chunks = chunks;
    }
    options.hash = args.hash;

    if let Err(err) = run(&args.url, &args.output, options).await {
        error!("fetch failed: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn run(url: &str, output: &Option<String>, options: XgetOptions) -> xget::Result<()> {
    let xget = Xget::new(url, options)?;
    let mut events = xget.subscribe();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                XgetEvent::Loaded(load) => {
                    info!(
                        "loaded: size={:?} chunkable={} plan_len={}",
                        load.size,
                        load.chunkable,
                        load.plan.len()
                    );
                }
                XgetEvent::Set => info!("middleware store populated"),
                XgetEvent::Retry(slice) => warn!(
                    "retry (meta={}) index={:?} attempt={}/{}: {}",
                    slice.meta, slice.index, slice.retry_count, slice.max_retries, slice.last_err
                ),
                XgetEvent::End => info!("fetch complete"),
                XgetEvent::Error { message, .. } => error!("fetch error: {message}"),
            }
        }
    });

    match output {
        Some(path) => {
            let file = tokio::fs::File::create(path).await.map_err(XgetError::from)?;
            xget.pipe(file).await?;
        }
        None => {
            xget.pipe(tokio::io::stdout()).await?;
        }
    }

    if let Some(hash) = xget.get_hash() {
        info!("digest: {hash}");
    }

    Ok(())
}
