//! Command-line demo for the bridge stack.
//!
//! Loads a configuration document and exercises the resolver, cache and
//! façade against the in-process simulator engine, so the full read/write
//! path can be inspected without a real engine on the host.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use routine_bridge::lifecycle::NoWatch;
use routine_bridge::sim::SimEngine;
use routine_bridge::{
    BridgeDriver, ConfigDocument, EngineReady, HandleCache, Lifecycle, ParameterFacade,
    PolicyFlags, Resolver,
};

#[derive(Parser)]
#[command(name = "routine-bridge", version, about = "Routine bridge demo driver")]
struct Cli {
    /// Configuration document.
    #[arg(short, long, global = true, default_value = "bridge.xml")]
    config: String,

    /// Configuration section to drive.
    #[arg(short, long, global = true, default_value = "default")]
    section: String,

    /// Policy flag bits (warn-if-idle=1, start-if-idle=2, stop-if-started=4,
    /// always-stop=8, no-auto-start=16, verbose=32).
    #[arg(long, default_value_t = 0)]
    policy: u32,

    /// Exit instead of waiting when the engine is not ready.
    #[arg(long)]
    managed_restart: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the parameters configured for the section.
    Params,
    /// Evaluate one raw resolver query against the document.
    Query { path: String },
    /// Read a parameter as text.
    Read { param: String },
    /// Write a parameter, then read it back.
    Write { param: String, value: String },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();
    match run(&Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let doc = ConfigDocument::load(&cli.config)
        .with_context(|| format!("loading '{}'", cli.config))?;
    let resolver = Arc::new(Resolver::new(doc));

    if let Command::Query { path } = &cli.command {
        match resolver.resolve_string(path) {
            value if value.is_empty() => println!("(no match)"),
            value => println!("{value}"),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let policy = PolicyFlags::from_bits(cli.policy);
    let sim = seeded_simulator(&resolver, &cli.section);
    let cache = Arc::new(HandleCache::new(
        Box::new(sim.connector()),
        None,
        None,
        policy,
    ));
    let lifecycle = Lifecycle::new(
        Arc::clone(&cache),
        Box::new(NoWatch),
        std::time::Duration::from_secs(30),
    )
    .with_managed_restart(cli.managed_restart);
    if lifecycle.await_engine_ready() == EngineReady::RestartRequested {
        eprintln!("engine not ready, exiting for supervisor restart");
        return Ok(ExitCode::from(3));
    }

    let facade = Arc::new(ParameterFacade::new(&cli.section, resolver, cache));
    let driver = BridgeDriver::new("demo0", facade);

    match &cli.command {
        Command::Params => {
            for (name, kind) in driver.params() {
                println!("{name}\t{kind:?}");
            }
        }
        Command::Read { param } => {
            let text = driver
                .read_octet(param, 256)
                .map_err(|diag| anyhow::anyhow!("{diag}"))?;
            println!("{param} = {text}");
        }
        Command::Write { param, value } => {
            write_parsed(&driver, param, value).map_err(|diag| anyhow::anyhow!("{diag}"))?;
            let text = driver
                .read_octet(param, 256)
                .map_err(|diag| anyhow::anyhow!("{diag}"))?;
            println!("{param} = {text}");
        }
        Command::Query { .. } => unreachable!("handled above"),
    }
    lifecycle.at_exit();
    Ok(ExitCode::SUCCESS)
}

/// Stand up a simulator exposing the routines the section refers to.
fn seeded_simulator(resolver: &Resolver, section: &str) -> SimEngine {
    let sim = SimEngine::new();
    let routine =
        resolver.resolve_native_path(&format!("/bridge/section[@name='{section}']/routine/@path"));
    if !routine.is_empty() {
        sim.define_routine(&routine);
    }
    let extint = resolver.resolve_native_path("/bridge/extint/@path");
    if !extint.is_empty() {
        sim.define_routine(&extint);
        sim.mark_external_interface(&extint);
    }
    sim
}

fn write_parsed(
    driver: &BridgeDriver,
    param: &str,
    raw: &str,
) -> routine_bridge::DriverResult<()> {
    if let Ok(int) = raw.parse::<i32>() {
        return driver.write_int32(param, int);
    }
    if let Ok(float) = raw.parse::<f64>() {
        return driver.write_float64(param, float);
    }
    driver.write_octet(param, raw)
}
