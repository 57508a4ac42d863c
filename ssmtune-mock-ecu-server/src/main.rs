//! Mock SSM ECU for testing ssmtune
//!
//! Usage: cargo run -p ssmtune-mock-ecu-server
//! Then point ssmtune at 127.0.0.1:35000

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, error, info, warn};
use ssmtune_protocol_lib::{split_frame, Endpoint, SimulatedEcu, FRAME_START};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Engine speed, big endian, RPM x 4
const RPM_ADDRESS: u32 = 0x00_000E;
/// Coolant temperature, degrees C + 40
const COOLANT_ADDRESS: u32 = 0x00_0008;
/// Vehicle speed, km/h
const SPEED_ADDRESS: u32 = 0x00_0010;

#[derive(Parser, Debug)]
#[command(name = "ssmtune-mock-ecu")]
#[command(about = "Simulated SSM ECU over TCP")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:35000")]
    bind: String,

    /// Which control unit to answer as
    #[arg(short, long, value_enum, default_value_t = Device::Ecu)]
    device: Device,

    /// ROM image to map at address 0
    #[arg(short, long)]
    rom: Option<PathBuf>,

    /// Interval between streamed replies in milliseconds
    #[arg(short, long, default_value = "20")]
    stream_interval: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Device {
    Ecu,
    Tcu,
}

impl From<Device> for Endpoint {
    fn from(device: Device) -> Self {
        match device {
            Device::Ecu => Self::Ecu,
            Device::Tcu => Self::Tcu,
        }
    }
}

/// One simulated device shared by every connection, so writes persist
type SharedEcu = Arc<Mutex<SimulatedEcu>>;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let endpoint = Endpoint::from(args.device);
    let mut ecu = SimulatedEcu::new(endpoint, SimulatedEcu::default_identity());
    if let Some(path) = &args.rom {
        let rom = std::fs::read(path).with_context(|| format!("reading ROM image {}", path.display()))?;
        ecu.load(0, &rom);
        info!("Mapped {} byte ROM image from {}", rom.len(), path.display());
    }
    let ecu: SharedEcu = Arc::new(Mutex::new(ecu));
    let start_time = Instant::now();
    let interval = Duration::from_millis(args.stream_interval.max(1));

    info!("Mock {endpoint} starting on {}...", args.bind);
    let listener = TcpListener::bind(&args.bind).with_context(|| format!("binding {}", args.bind))?;
    info!("Mock {endpoint} ready - waiting for connections...");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                info!("Client connected: {:?}", stream.peer_addr());
                let ecu = Arc::clone(&ecu);
                std::thread::spawn(move || {
                    if let Err(e) = handle_client(stream, &ecu, start_time, interval) {
                        warn!("Client error: {e:#}");
                    }
                    info!("Client disconnected");
                });
            }
            Err(e) => error!("Connection error: {e}"),
        }
    }
    Ok(())
}

fn lock(ecu: &SharedEcu) -> Result<MutexGuard<'_, SimulatedEcu>> {
    ecu.lock().map_err(|_| anyhow!("device state poisoned"))
}

fn handle_client(
    mut stream: TcpStream,
    ecu: &SharedEcu,
    start_time: Instant,
    interval: Duration,
) -> Result<()> {
    stream.set_nodelay(true)?;
    // Read timeouts double as the streaming clock
    stream.set_read_timeout(Some(interval))?;
    let mut pending = Vec::new();
    let mut buf = [0u8; 512];

    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => pending.extend_from_slice(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => return Err(e).context("reading from client"),
        }

        let mut device = lock(ecu)?;
        update_sensors(&mut device, start_time);

        let mut replied = false;
        while let Some((frame, consumed)) = split_frame(&pending) {
            debug!("RX: {}", hex::encode(frame));
            if let Some(reply) = device.handle_frame(frame) {
                debug!("TX: {}", hex::encode(&reply));
                stream.write_all(&reply).context("writing reply")?;
                replied = true;
            }
            pending.drain(..consumed);
        }
        if !pending.contains(&FRAME_START) {
            pending.clear();
        }

        if !replied {
            if let Some(frame) = device.stream_frame() {
                stream.write_all(&frame).context("writing stream frame")?;
            }
        }
    }
}

fn update_sensors(ecu: &mut SimulatedEcu, start_time: Instant) {
    let rpm = get_rpm_value(start_time);
    ecu.load(RPM_ADDRESS, &rpm.to_be_bytes());
    ecu.load(COOLANT_ADDRESS, &[40 + 85]);
    ecu.load(SPEED_ADDRESS, &[40]);
}

/// Raw engine speed (RPM x 4) following a ramp, hold, ramp, idle cycle
fn get_rpm_value(start_time: Instant) -> u16 {
    rpm_at(start_time.elapsed().as_secs_f32())
}

fn rpm_at(elapsed: f32) -> u16 {
    const MIN_RPM: f32 = 800.0;
    const MAX_RPM: f32 = 3500.0;
    const RAMP_TIME: f32 = 4.0;
    const HOLD_TIME: f32 = 3.0;
    const CYCLE_TIME: f32 = 2.0 * (RAMP_TIME + HOLD_TIME);

    let phase = elapsed % CYCLE_TIME;

    let rpm = if phase < RAMP_TIME {
        MIN_RPM + (MAX_RPM - MIN_RPM) * (phase / RAMP_TIME)
    } else if phase < RAMP_TIME + HOLD_TIME {
        MAX_RPM
    } else if phase < 2.0 * RAMP_TIME + HOLD_TIME {
        let ramp_phase = phase - RAMP_TIME - HOLD_TIME;
        MAX_RPM - (MAX_RPM - MIN_RPM) * (ramp_phase / RAMP_TIME)
    } else {
        MIN_RPM
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // 4 x 3500 fits
    let raw = (rpm * 4.0) as u16;
    raw
}
