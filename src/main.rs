use std::net::SocketAddr;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use trace8::bus::BusTransaction;
use trace8::config::{EngineConfig, RunProfile, ServerConfig};
use trace8::controller::{ExecutionController, ExecutionObserver, Flow, RunStatus};
use trace8::cpu::CycleRecord;
use trace8::error::{Fault, LoadError};
use trace8::server::run_server;
use trace8::snapshots::MachineSnapshot;
use trace8::templates::ProgramTemplate;

#[derive(Parser)]
#[command(version, about = "Step-by-step 8-bit CPU emulation for operation traces")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Serve the HTTP session API.
    Serve {
        #[arg(long, env = "TRACE8_ADDR", default_value = "127.0.0.1:3030")]
        addr: SocketAddr,
        /// Profile for sessions that do not ask for one.
        #[arg(long, default_value = "standard")]
        profile: RunProfile,
    },
    /// Run a built-in program and print its trace.
    Demo {
        /// Template id, see `trace8 templates`.
        template: String,
        /// Overrides the template's own profile.
        #[arg(long)]
        profile: Option<RunProfile>,
        /// Sleep between cycles as the profile asks.
        #[arg(long)]
        animate: bool,
        /// Print the final snapshot as JSON instead of the trace.
        #[arg(long)]
        json: bool,
    },
    /// List the built-in programs.
    Templates,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("run faulted: {0}")]
    Fault(Fault),
}

/// Prints each committed cycle the way the bus panel shows it.
struct TracePrinter {
    delay: std::time::Duration,
    quiet: bool,
}

impl ExecutionObserver for TracePrinter {
    fn on_cycle_complete(
        &mut self,
        _snapshot: &MachineSnapshot,
        record: &CycleRecord,
        transactions: &[BusTransaction],
    ) -> Flow {
        if !self.quiet {
            println!("cycle {:>4}  line {:>3}  {}", record.cycle, record.source_line, record.text);
            if let Some(alu) = &record.alu {
                println!(
                    "           ALU {} {} {} = {} (flags {:04b})",
                    alu.a,
                    alu.op.symbol(),
                    alu.b,
                    alu.result,
                    alu.flags.bits()
                );
            }
            for t in transactions {
                println!("           {t}");
            }
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Flow::Continue
    }

    fn on_output(&mut self, text: &str) {
        if !self.quiet {
            println!("  >> {text}");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let result = match cli.cmd {
        Cmd::Serve { addr, profile } => {
            run_server(ServerConfig {
                addr,
                default_profile: profile,
            })
            .await;
            Ok(())
        }
        Cmd::Demo {
            template,
            profile,
            animate,
            json,
        } => demo(&template, profile, animate, json),
        Cmd::Templates => list_templates(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn demo(id: &str, profile: Option<RunProfile>, animate: bool, json: bool) -> Result<(), CliError> {
    let template = ProgramTemplate::find(id)?.ok_or_else(|| CliError::UnknownTemplate(id.to_string()))?;
    let profile = profile.unwrap_or(template.profile);

    let mut controller = ExecutionController::new(EngineConfig::from_profile(profile));
    controller.load_program(template.build()?);

    if !json {
        println!("{} ({} operations, {} profile)", template.name, template.operations.len(), profile.as_str());
        for (n, line) in template.source.iter().enumerate() {
            println!("{:>3} | {line}", n + 1);
        }
        println!();
    }

    let mut printer = TracePrinter {
        delay: if animate {
            profile.get_limits().cycle_delay()
        } else {
            std::time::Duration::ZERO
        },
        quiet: json,
    };
    let status = controller.run(&mut printer);
    let snapshot = controller.snapshot();

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!();
        println!(
            "{} cycles, {} bus transactions, flags {:?}",
            snapshot.cycles, snapshot.transaction_count, snapshot.flags
        );
        for alloc in template.address_map.allocations() {
            let values: Vec<u8> = (0..alloc.len).map(|i| snapshot.read(alloc.base + i)).collect();
            println!("  {:<8} ${:02X}  {:?}", alloc.name, alloc.base, values);
        }
    }

    match status {
        RunStatus::Faulted { fault } => Err(CliError::Fault(fault)),
        _ => Ok(()),
    }
}

fn list_templates() -> Result<(), CliError> {
    for template in ProgramTemplate::create_builtin_templates()? {
        println!("{:<16} {:<16} {}", template.id, template.name, template.description);
    }
    Ok(())
}
