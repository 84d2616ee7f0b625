//! Main of the OCFS2 metadata tools.

mod o2image;
mod o2info;

use std::env;
use std::fmt;
use std::process::exit;

/// Writes an error to stderr, then exits.
pub fn error<M: fmt::Display>(bin: &str, msg: M) -> ! {
    eprintln!("{bin}: error: {msg}");
    exit(1);
}

fn main() {
    env_logger::init();

    let mut args = env::args_os();
    let bin = args
        .next()
        .and_then(|s| s.into_string().ok())
        .map(|s| {
            s.rsplit('/')
                .next()
                .map(str::to_owned)
                .unwrap_or(s)
        })
        .unwrap_or_else(|| {
            error("o2tools", "missing binary name");
        });
    match bin.as_str() {
        "o2image" => o2image::main(args),
        "o2info" => o2info::main(args),
        // running the multi-call binary directly: the tool name comes first
        _ => {
            let Some(tool) = args.next().and_then(|s| s.into_string().ok()) else {
                error("o2tools", "usage: o2tools <o2image|o2info> [args]");
            };
            match tool.as_str() {
                "o2image" => o2image::main(args),
                "o2info" => o2info::main(args),
                _ => error("o2tools", format_args!("unknown tool `{tool}`")),
            }
        }
    }
}
