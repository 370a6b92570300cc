//! demohost - a host application exposing a turtle to a visual-programming client
//!
//! Starts the bridge, registers one turtle target and runs a fixed-rate tick
//! loop. Saved programs are written to a JSON state file on every save and
//! loaded again at startup.

mod turtle;

use anyhow::{Context, Result};
use blockly_bridge::{
    BridgeConfig, CapabilityRegistry, Dispatcher, EventDef, MethodDef, ParamKind, ProgramState, Programmable,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use turtle::{Turtle, GRID_SIZE, MOVEMENT_CATEGORY, TURN_OPTIONS};

const BUMP_EVENT: &str = "onBump";

#[derive(Parser, Debug)]
#[command(name = "demohost", about = "Serve a turtle to a visual-programming client")]
struct Args {
    /// Address to bind (overrides BLOCKLY_BRIDGE_ADDR)
    #[arg(long)]
    address: Option<String>,
    /// Port to bind (overrides BLOCKLY_BRIDGE_PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Where saved programs are persisted
    #[arg(long, default_value = "programs.json")]
    state_file: PathBuf,
    /// Milliseconds between host ticks
    #[arg(long, default_value_t = 16)]
    tick_ms: u64,
    /// Stop after this many ticks (runs forever when omitted)
    #[arg(long)]
    max_ticks: Option<u64>,
}

fn turtle_of(target: &dyn Programmable) -> Option<&Turtle> {
    target.as_any().downcast_ref::<Turtle>()
}

// =============================================================================
// Capabilities
// =============================================================================

fn build_registry() -> Result<CapabilityRegistry> {
    let registry = CapabilityRegistry::builder()
        .category(MOVEMENT_CATEGORY, 160)
        .category("looks", 260)
        .category("sensing", 190)
        .category("events", 45)
        .method(
            MethodDef::new("moveForward", MOVEMENT_CATEGORY)
                .param("steps", ParamKind::Integer)
                .invoke_with(|target, args| {
                    let steps = args[0].as_int().unwrap_or(0).clamp(0, GRID_SIZE as i64) as u32;
                    turtle_of(target).map(|t| t.move_forward(steps))
                }),
        )
        .method(
            MethodDef::new("turn", MOVEMENT_CATEGORY)
                .param("direction", ParamKind::enumeration("TurnDirection", TURN_OPTIONS))
                .invoke_with(|target, args| {
                    let direction = args[0].enum_index().unwrap_or(0);
                    turtle_of(target).map(|t| t.turn(direction))
                }),
        )
        .method(
            MethodDef::new("say", "looks")
                .param("text", ParamKind::String)
                .invoke_with(|target, args| {
                    let text = args[0].as_str().unwrap_or_default().to_string();
                    turtle_of(target).map(|t| t.say(text))
                }),
        )
        .method(
            MethodDef::new("isBlocked", "sensing")
                .returns(ParamKind::Bool)
                .invoke_with(|target, _| turtle_of(target).map(|t| t.is_blocked().into_method())),
        )
        .event(EventDef::new(BUMP_EVENT, "events").stackable(true))
        .build()?;
    Ok(registry)
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = BridgeConfig::new();
    if let Some(address) = args.address {
        config = config.with_address(address);
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }

    let mut dispatcher = Dispatcher::new(build_registry()?)?;

    if args.state_file.exists() {
        match ProgramState::load(&args.state_file) {
            Ok(state) => {
                info!(path = %args.state_file.display(), programs = state.len(), "loaded saved programs");
                dispatcher.set_state(state);
            }
            Err(e) => warn!(path = %args.state_file.display(), error = %e, "ignoring unreadable state file"),
        }
    }

    let state_file = args.state_file.clone();
    dispatcher.on_save(move |state| {
        if let Err(e) = state.save(&state_file) {
            warn!(path = %state_file.display(), error = %e, "could not persist programs");
        }
    });

    let turtle = Arc::new(Turtle::new("Turtle"));
    dispatcher.register(turtle.clone());

    let client_ready = Arc::new(AtomicBool::new(false));
    let ready_flag = Arc::clone(&client_ready);
    let addr = dispatcher
        .start(&config, move || ready_flag.store(true, Ordering::SeqCst))
        .context("failed to start the bridge")?;
    info!(%addr, guid = turtle.guid(), "demo host ready");

    let tick = Duration::from_millis(args.tick_ms.max(1));
    let mut ticks: u64 = 0;
    while args.max_ticks.map_or(true, |max| ticks < max) {
        dispatcher.update();
        if client_ready.swap(false, Ordering::SeqCst) {
            dispatcher.set_target(turtle.clone());
        }

        turtle.tick();
        if turtle.take_bump() {
            info!(pose = ?turtle.pose(), "turtle bumped into the edge");
            dispatcher.send_event(turtle.as_ref(), BUMP_EVENT);
        }

        ticks += 1;
        thread::sleep(tick);
    }

    info!(ticks, pending = turtle.pending(), "stopping demo host");
    dispatcher.stop();
    Ok(())
}
