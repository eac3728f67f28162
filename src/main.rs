use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use aotlink::module::cache;

#[derive(Parser)]
#[command(name = "aotlink")]
#[command(about = "Inspect and verify serialized ahead-of-time module caches", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the header and metadata tables of a cache file
    Inspect {
        /// The cache file to inspect
        file: PathBuf,

        /// Emit JSON instead of human-readable output
        #[arg(long)]
        json: bool,

        /// Trace cache parsing to stderr
        #[arg(long)]
        trace: bool,
    },
    /// Check whether a cache file was produced on this machine and build
    Verify {
        /// The cache file to verify
        file: PathBuf,

        /// Trace cache parsing to stderr
        #[arg(long)]
        trace: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { file, json, trace } => {
            let data = match std::fs::read(&file) {
                Ok(data) => data,
                Err(e) => {
                    eprintln!("{}: {}", file.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            if trace {
                eprintln!("[cache] read {} bytes from {}", data.len(), file.display());
            }
            let summary = match cache::read_summary(&data) {
                Ok(summary) => summary,
                Err(e) => {
                    eprintln!("{}: {}", file.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            if json {
                match serde_json::to_string_pretty(&summary) {
                    Ok(out) => println!("{}", out),
                    Err(e) => {
                        eprintln!("json encoding failed: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                print_summary(&summary);
            }
        }
        Commands::Verify { file, trace } => {
            let data = match std::fs::read(&file) {
                Ok(data) => data,
                Err(e) => {
                    eprintln!("{}: {}", file.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            if trace {
                eprintln!("[cache] read {} bytes from {}", data.len(), file.display());
            }
            match cache::read_summary(&data) {
                Ok(summary) if summary.matches_this_machine => {
                    println!("{}: ok", file.display());
                }
                Ok(summary) => {
                    println!(
                        "{}: stale (built for cpu features {:#010x}, build {})",
                        file.display(),
                        summary.cpu_features,
                        summary.build_id
                    );
                    return ExitCode::FAILURE;
                }
                Err(e) => {
                    eprintln!("{}: {}", file.display(), e);
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    ExitCode::SUCCESS
}

fn print_summary(summary: &cache::CacheSummary) {
    println!("format version:   {}", summary.version);
    println!(
        "machine:          cpu features {:#010x}, build {}{}",
        summary.cpu_features,
        summary.build_id,
        if summary.matches_this_machine {
            " (this machine)"
        } else {
            " (foreign)"
        }
    );
    println!("source:           {} bytes", summary.source_bytes);
    println!(
        "code:             {} bytes (+{} global data)",
        summary.code_bytes, summary.global_data_bytes
    );
    println!(
        "heap:             {}..{} bytes{}",
        summary.min_heap_length,
        summary.max_heap_length,
        if summary.uses_signal_handlers {
            ", signal-handler bounds checks"
        } else {
            ""
        }
    );
    if summary.strict {
        println!("strict:           yes");
    }
    println!(
        "tables:           {} globals, {} exits, {} call sites, {} heap accesses, {} fn-ptr tables",
        summary.num_globals,
        summary.num_exits,
        summary.num_call_sites,
        summary.num_heap_accesses,
        summary.num_func_ptr_tables
    );
    println!(
        "links:            {} relative, {} absolute buckets",
        summary.num_relative_links, summary.num_absolute_links
    );
    println!("exports:");
    for name in &summary.exports {
        println!("  {}", name);
    }
    println!("functions:");
    for func in &summary.functions {
        println!(
            "  {} (line {}) [{:#x}, {:#x})",
            func.name, func.line, func.begin, func.end
        );
    }
}
