//! Voltage Modbus Slave
//!
//! Runs a Modbus TCP slave over an in-memory register bank and reports the
//! number of connected masters until Ctrl-C.
//!
//! Usage: cargo run --bin modbus-slave -- --bind 0.0.0.0:5020 --unit-id 1
//!
//! `RUST_LOG` overrides `--log-level` when set.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voltage_modbus_slave::{
    BankSizes, ModbusResult, ModbusTcpServer, RegisterBank, ServerConfig, DEFAULT_TCP_PORT,
};

#[derive(Parser, Debug)]
#[command(name = "modbus-slave", version, about = "Modbus TCP slave over an in-memory register bank")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "MODBUS_BIND", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_TCP_PORT)))]
    bind: SocketAddr,

    /// Only answer this unit id (answers all when omitted)
    #[arg(long)]
    unit_id: Option<u8>,

    /// Maximum number of concurrent masters
    #[arg(long, default_value_t = 100)]
    max_connections: usize,

    /// Close sessions idle for this many seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Coils and discrete inputs per table
    #[arg(long, default_value_t = 10_000)]
    coils: usize,

    /// Holding and input registers per table
    #[arg(long, default_value_t = 10_000)]
    registers: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log every frame as hex (needs debug level)
    #[arg(long)]
    packet_logging: bool,

    /// Seconds between master count reports
    #[arg(long, default_value_t = 10)]
    report_interval_secs: u64,
}

fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ModbusResult<()> {
    let args = Args::parse();
    init_logging(&args.log_level);
    info!("{}", voltage_modbus_slave::info());

    let bank = Arc::new(RegisterBank::new(BankSizes {
        coils: args.coils,
        discrete_inputs: args.coils,
        holding_registers: args.registers,
        input_registers: args.registers,
    }));

    let config = ServerConfig::new(args.bind)
        .with_unit_id(args.unit_id)
        .with_max_connections(args.max_connections)
        .with_idle_timeout(args.idle_timeout_secs.map(Duration::from_secs))
        .with_packet_logging(args.packet_logging);

    let mut server = ModbusTcpServer::new(config, bank)?;
    let addr = server.start().await?;
    info!("Serving on {}, press Ctrl-C to stop", addr);

    let mut report = tokio::time::interval(Duration::from_secs(args.report_interval_secs.max(1)));
    report.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
            result = server.wait() => {
                if let Err(e) = &result {
                    error!("Listener stopped: {}", e);
                }
                server.stop().await?;
                return result;
            }
            _ = report.tick() => {
                let stats = server.stats();
                info!(
                    "{} master(s) connected, {} requests, {} exceptions, {} rejected",
                    server.registry().count(),
                    stats.requests,
                    stats.exceptions,
                    stats.connections_rejected
                );
            }
        }
    }

    server.stop().await?;
    info!("Stopped");
    Ok(())
}
