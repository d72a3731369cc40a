extern crate linux_embedded_hal as hal;
extern crate mpu9250;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use embedded_hal::blocking::delay::DelayMs;
use hal::spidev::{self, SpidevOptions};
use hal::sysfs_gpio::Direction;
use hal::{Delay, Pin, Spidev};
use mpu9250::{Marg, MargMeasurements, Mpu9250, SpiDevice};
use tracing::{debug, info, warn};

use magcal::config::{self, SensorConfig};
use magcal::{MagCalibration, MargFusion, V};

type Mpu = Mpu9250<SpiDevice<Spidev, Pin>, Marg>;

/// Consecutive failed reads after which the sensor is treated as gone.
const MAX_FAILED_READS: u32 = 100;

#[derive(Parser, Debug)]
#[command(
    name = "main",
    about = "Track MPU-9250 orientation and auto-calibrate its magnetometer"
)]
struct Cli {
    /// TOML config file, defaults are used if it does not exist
    #[arg(long, default_value = "magcal.toml")]
    config: PathBuf,
    /// Stop after this many sensor reads, failed ones included
    #[arg(long)]
    max_samples: Option<u64>,
}

fn open_mpu_port(sensor: &SensorConfig) -> Result<Mpu> {
    let mut spi = Spidev::open(&sensor.spi_device)?;
    let options = SpidevOptions::new()
        .max_speed_hz(1_000_000)
        .mode(spidev::SPI_MODE_3)
        .build();
    spi.configure(&options)?;

    let ncs = Pin::new(sensor.ncs_pin);
    ncs.export()?;
    while !ncs.is_exported() {}
    ncs.set_direction(Direction::High)?;

    Mpu9250::marg_default(spi, ncs, &mut Delay).map_err(|e| anyhow!("mpu9250 init: {:?}", e))
}

fn under_cap(attempts: u64, max: Option<u64>) -> bool {
    max.map_or(true, |max| attempts < max)
}

/// Run of back-to-back read failures.
#[derive(Debug, Default)]
struct FailedReads {
    streak: u32,
}

impl FailedReads {
    fn succeeded(&mut self) {
        self.streak = 0;
    }

    fn failed(&mut self) -> Result<()> {
        self.streak += 1;
        if self.streak >= MAX_FAILED_READS {
            bail!("{} MPU-9250 reads failed in a row", self.streak);
        }
        Ok(())
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "magcal=info,main=info".into()),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = config::load_config(&cli.config)?;
    let sensor = &config.sensor;

    let mut mpu = open_mpu_port(sensor)?;
    info!(device = %sensor.spi_device, ncs = sensor.ncs_pin, "MPU-9250 ready");

    let mut fusion = MargFusion::new(config.filter.gains());
    let mut calibration = MagCalibration::new(config.calibration.thresholds());
    calibration.begin_auto_calibration(&mut fusion);

    let mut delay = Delay;
    let mut last = Instant::now();
    let mut state = calibration.state();
    let mut held = 0;
    let mut reads: u64 = 0;
    let mut failures = FailedReads::default();

    while under_cap(reads, cli.max_samples) {
        delay.delay_ms(sensor.sample_period_ms);
        reads += 1;

        let all: MargMeasurements<[f32; 3]> = match mpu.all() {
            Ok(all) => {
                failures.succeeded();
                all
            }
            Err(e) => {
                warn!(error = ?e, streak = failures.streak + 1, "MPU-9250 read failed");
                failures.failed()?;
                continue;
            }
        };
        let now = Instant::now();
        let dt = now.duration_since(last).as_secs_f32();
        last = now;

        let mag = V::from(all.mag) * sensor.mag_to_gauss;
        let q = fusion.update(V::from(all.gyro), V::from(all.accel), mag, dt);

        let next = calibration.update_auto_calibration(&mut fusion);
        if next != state {
            info!(state = ?next, reads, "calibration state changed");
            state = next;
        }
        if calibration.sample_count() != held {
            held = calibration.sample_count();
            debug!(held, "calibration samples held");
        }

        if calibration.is_calibrated() && reads % 100 == 0 {
            let e = q.roll_pitch_yaw();
            info!(roll = e.roll, pitch = e.pitch, yaw = e.yaw, "orientation");
        }
    }

    match calibration.mag_center() {
        Some(c) => info!(x = c.x, y = c.y, z = c.z, "hard-iron bias (gauss)"),
        None => warn!(held, "magnetometer was not calibrated, keep turning the device"),
    }
    Ok(())
}
