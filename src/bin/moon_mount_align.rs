// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io::BufRead;
use std::sync::{Arc, mpsc};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::CanonicalError;
use clap::Parser;
use log::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};
use tracing_appender::non_blocking::NonBlockingBuilder;

use moon_mount::alignment::AlignmentEngine;
use moon_mount::astro_util::{alt_az_from_equatorial, angular_separation};
use moon_mount::clock::{Clock, SystemClock, format_timestamp};
use moon_mount::ephemeris::{Ephemeris, MoonEphemeris};
use moon_mount::frame_rotation::ShiftOrientation;
use moon_mount::image_registration::ImageRegistration;
use moon_mount::instruction::Direction;
use moon_mount::lx200_driver::Lx200Driver;
use moon_mount::mount::Mount;
use moon_mount::mount_driver::MountDriver;
use moon_mount::settings::{ARCSEC, AlignmentSettings, CameraSettings,
                           MountSettings, RegistrationSettings};
use moon_mount::simulated_camera::SimulatedCamera;
use moon_mount::simulated_mount::SimulatedMount;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// host:port of the mount's LX200 command interface.
    #[arg(long, default_value = "localhost:4030")]
    mount_address: String,

    /// Run against a simulated mount and camera instead of real hardware.
    /// Alignments after the first are then automatic.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Observer latitude, degrees. When given together with longitude, the
    /// Moon's position is corrected for parallax.
    #[arg(long)]
    latitude: Option<f64>,

    /// Observer longitude, degrees, positive east.
    #[arg(long)]
    longitude: Option<f64>,

    /// Offset of the landmark from the Moon's center in right ascension,
    /// arcseconds.
    #[arg(long, default_value = "0.0", allow_hyphen_values = true)]
    landmark_ra_offset: f64,

    /// Offset of the landmark from the Moon's center in declination,
    /// arcseconds.
    #[arg(long, default_value = "0.0", allow_hyphen_values = true)]
    landmark_de_offset: f64,

    /// Interval between mount position samples, seconds.
    #[arg(long, value_parser = parse_duration, default_value = "0.2")]
    polling_interval: Duration,

    /// Position readings closer than this, arcseconds, mean the mount has
    /// settled.
    #[arg(long, default_value = "1.0")]
    lookup_precision: f64,

    /// How long to wait for a mount instruction to complete, seconds. Zero
    /// waits indefinitely.
    #[arg(long, value_parser = parse_duration, default_value = "180.0")]
    instruction_timeout: Duration,

    /// Minimum time between the alignment points used for drift, seconds.
    #[arg(long, default_value = "600.0")]
    min_drift_interval: f64,

    /// Bounds of the automatic alignment interval, seconds.
    #[arg(long, default_value = "30.0")]
    min_auto_align_interval: f64,
    #[arg(long, default_value = "300.0")]
    max_auto_align_interval: f64,

    /// How often the operator is asked to re-align when alignment is manual,
    /// seconds.
    #[arg(long, value_parser = parse_duration, default_value = "300.0")]
    realign_interval: Duration,

    /// Camera pixel size, micrometers.
    #[arg(long, default_value = "3.75")]
    pixel_size: f64,

    /// Telescope focal length, millimeters.
    #[arg(long, default_value = "2000.0")]
    focal_length: f64,

    /// Binning of the still images used for automatic alignment.
    #[arg(long, default_value = "2")]
    compression: u32,

    /// Camera position angle, degrees east of north.
    #[arg(long, default_value = "0.0", allow_hyphen_values = true)]
    position_angle: f64,

    #[arg(long, default_value = ".")]
    log_dir: String,

    #[arg(long, default_value = "moon_mount_log.txt")]
    log_file: String,
}

fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseFloatError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs_f64(seconds))
}

// Systematic slew error of the simulated mount, radians.
const SIMULATED_SLEW_ERROR: (f64, f64) = (40.0 * ARCSEC, -25.0 * ARCSEC);

fn main() {
    let args = Args::parse();

    // Set up logging.
    let file_appender = tracing_appender::rolling::never(&args.log_dir, &args.log_file);
    // Create non-blocking writers for both the file and stdout.
    let (non_blocking_file, _guard1) =
        NonBlockingBuilder::default().lossy(false).finish(file_appender);
    let (non_blocking_stdout, _guard2) =
        NonBlockingBuilder::default().lossy(false).finish(std::io::stdout());

    let _subscriber = registry()
        .with(EnvFilter::try_from_default_env()
              .unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer()
              .with_ansi(false)
              .with_writer(non_blocking_file))
        .init();

    let got_signal = Arc::new(AtomicBool::new(false));
    let got_signal2 = got_signal.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Got control-c");
        got_signal2.store(true, AtomicOrdering::Relaxed);
    }) {
        error!("Could not install control-c handler: {:?}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(&args, got_signal) {
        error!("{:?}", e);
        std::process::exit(1);
    }
    info!("Exiting");
}

fn run(args: &Args, got_signal: Arc<AtomicBool>) -> Result<(), CanonicalError> {
    let clock: Arc<dyn Clock + Send + Sync> = Arc::new(SystemClock::default());
    let site = match (args.latitude, args.longitude) {
        (Some(lat), Some(long)) => Some((lat.to_radians(), long.to_radians())),
        (None, None) => None,
        _ => {
            warn!("Need both latitude and longitude; using geocentric positions");
            None
        }
    };
    let moon = match site {
        Some((lat, long)) => MoonEphemeris::with_site(lat, long),
        None => MoonEphemeris::new(),
    };
    let landmark_offset = (args.landmark_ra_offset * ARCSEC,
                           args.landmark_de_offset * ARCSEC);

    let mount_settings = MountSettings{
        polling_interval: args.polling_interval,
        lookup_precision_arcsec: args.lookup_precision,
        instruction_timeout: if args.instruction_timeout.is_zero() {
            None
        } else {
            Some(args.instruction_timeout)
        },
        ..Default::default()
    };
    let alignment_settings = AlignmentSettings{
        min_drift_interval: args.min_drift_interval,
        min_auto_align_interval: args.min_auto_align_interval,
        max_auto_align_interval: args.max_auto_align_interval,
        camera_position_angle: args.position_angle.to_radians(),
        ..Default::default()
    };
    let camera_settings = CameraSettings{
        pixel_size_um: args.pixel_size,
        focal_length_mm: args.focal_length,
        compression_factor: args.compression,
    };
    let scale_factor = camera_settings.scale_factor();

    // In simulation the mount starts near the landmark and a camera renders
    // the view from wherever it actually points.
    let mut simulated_camera = None;
    let driver: Box<dyn MountDriver + Send> = if args.simulate {
        let mut initial = moon.clone();
        initial.update(clock.now());
        let simulated_mount = SimulatedMount::new(
            clock.clone(),
            initial.ra() + landmark_offset.0, initial.de() + landmark_offset.1,
            mount_settings.guide_rate);
        let state = simulated_mount.state();
        state.lock().unwrap().slew_error = SIMULATED_SLEW_ERROR;
        simulated_camera = Some((state.clone(), SimulatedCamera::new(
            state, clock.clone(), Box::new(moon.clone()), landmark_offset,
            ShiftOrientation::with_position_angle(
                alignment_settings.camera_position_angle),
            scale_factor, 320, 240)));
        info!("Using simulated mount and camera");
        Box::new(simulated_mount)
    } else {
        info!("Using LX200 mount at {}", args.mount_address);
        Box::new(Lx200Driver::new(&args.mount_address))
    };

    let mount = Arc::new(Mount::new(driver, mount_settings, clock.clone())?);
    let polarity = mount.calibrate()?;
    info!("Mount polarity {:?}", polarity);

    let registration = ImageRegistration::new(
        RegistrationSettings::default(), camera_settings)?;
    let mut engine = AlignmentEngine::new(
        alignment_settings, args.focal_length, mount.clone(), Box::new(moon),
        clock.clone(), registration)?;
    engine.set_landmark_offset(landmark_offset.0, landmark_offset.1);

    let (ra, de) = engine.landmark_mount_position()?;
    report_moon(&engine, site, clock.now());
    mount.slew_to(ra, de)?;

    let operator_input = spawn_operator_input();
    match simulated_camera.as_ref() {
        Some((state, _)) => {
            // Stand in for the operator centering the landmark.
            let ephemeris = engine.ephemeris();
            let mut locked_state = state.lock().unwrap();
            locked_state.ra = ephemeris.ra() + landmark_offset.0;
            locked_state.de = ephemeris.de() + landmark_offset.1;
        },
        None => {
            center_landmark(&mount, &operator_input, &got_signal)?;
        }
    }
    if got_signal.load(AtomicOrdering::Relaxed) {
        return mount.terminate();
    }
    engine.align(true)?;
    let (mount_ra, mount_de) = mount.lookup_position()?;
    let (landmark_ra, landmark_de) = engine.landmark_mount_position()?;
    info!("Aligned; mount reads {:.1} arcsec from the landmark",
          angular_separation(mount_ra, mount_de, landmark_ra, landmark_de) / ARCSEC);

    let automatic = match simulated_camera {
        Some((_, camera)) => {
            let focal_error = engine.initialize_auto_align(Box::new(camera))?;
            info!("Automatic alignment ready, focal length error {:.3}", focal_error);
            true
        },
        None => false,
    };

    let result = guide_and_realign(&mut engine, &mount, automatic,
                                   args.realign_interval, &operator_input,
                                   &got_signal);
    if let Err(e) = mount.stop_guiding() {
        warn!("Error stopping guiding: {:?}", e);
    }
    let stats = engine.alignment_errors().session();
    info!("{} alignments this session, relative error mean {:.3} max {:.3}",
          stats.count, stats.mean, stats.max);
    mount.terminate()?;
    result
}

// Alternates between guiding at the tracking rate and re-aligning, until
// control-c.
fn guide_and_realign(engine: &mut AlignmentEngine,
                     mount: &Mount,
                     automatic: bool,
                     realign_interval: Duration,
                     operator_input: &mpsc::Receiver<String>,
                     got_signal: &AtomicBool) -> Result<(), CanonicalError> {
    while !got_signal.load(AtomicOrdering::Relaxed) {
        // Refreshes the ephemeris, and with it the tracking rate.
        engine.landmark_mount_position()?;
        let (rate_ra, rate_de) = engine.tracking_rate();
        mount.start_guiding(rate_ra, rate_de)?;
        info!("Guiding at {:.2}/{:.2} arcsec/s, alignment {:?}",
              rate_ra / ARCSEC, rate_de / ARCSEC, engine.status());

        if automatic {
            let interval = Duration::from_secs_f64(engine.auto_align_interval());
            if !wait_unless_signalled(interval, got_signal) {
                break;
            }
        } else {
            if !wait_unless_signalled(realign_interval, got_signal) {
                break;
            }
            // Discard anything typed before the prompt.
            while operator_input.try_recv().is_ok() {}
            println!("Re-center the landmark and press Enter to re-align");
            if wait_for_operator(operator_input, None, got_signal).is_none() {
                break;
            }
        }
        mount.stop_guiding()?;

        match engine.align(!automatic) {
            Ok(Some(error)) => info!("Alignment error {:.3}, next in {:.0}s",
                                     error, engine.auto_align_interval()),
            Ok(None) => (),
            Err(e) => warn!("Alignment failed: {:?}", e),
        }
        if let Some(drift) = engine.drift() {
            info!("Drift {:.4}/{:.4} arcsec/s", drift.0 / ARCSEC, drift.1 / ARCSEC);
        }
    }
    Ok(())
}

// Lets the operator walk the mount onto the landmark with n/s/e/w nudges,
// ending with an empty line.
fn center_landmark(mount: &Mount,
                   operator_input: &mpsc::Receiver<String>,
                   got_signal: &AtomicBool) -> Result<(), CanonicalError> {
    println!("Center the landmark. Enter n, s, e or w to nudge the mount, \
              or an empty line when centered");
    while let Some(line) = wait_for_operator(operator_input, None, got_signal) {
        let direction = match line.trim() {
            "" => return Ok(()),
            "n" => Direction::North,
            "s" => Direction::South,
            "e" => Direction::East,
            "w" => Direction::West,
            other => {
                println!("Unrecognized input {:?}", other);
                continue;
            }
        };
        mount.start_nudge(direction)?;
        thread::sleep(Duration::from_secs(1));
        mount.stop_nudge(direction)?;
    }
    Ok(())
}

fn report_moon(engine: &AlignmentEngine, site: Option<(f64, f64)>, time: f64) {
    let ephemeris = engine.ephemeris();
    info!("Moon at RA {:.4} DE {:.4} deg, radius {:.1} arcsec, {}",
          ephemeris.ra().to_degrees(), ephemeris.de().to_degrees(),
          ephemeris.radius() / ARCSEC, format_timestamp(time));
    if let Some((lat, long)) = site {
        let (alt, az) = alt_az_from_equatorial(
            ephemeris.ra(), ephemeris.de(), lat, long, time);
        info!("Moon altitude {:.1} azimuth {:.1} deg",
              alt.to_degrees(), az.to_degrees());
        if alt < 0.0 {
            warn!("Moon is below the horizon");
        }
    }
}

// Lines typed by the operator. The reader thread ends at EOF.
fn spawn_operator_input() -> mpsc::Receiver<String> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break; };
            if sender.send(line).is_err() {
                break;
            }
        }
    });
    receiver
}

// Returns None on timeout, control-c, or end of input.
fn wait_for_operator(operator_input: &mpsc::Receiver<String>,
                     timeout: Option<Duration>,
                     got_signal: &AtomicBool) -> Option<String> {
    let start = Instant::now();
    loop {
        if got_signal.load(AtomicOrdering::Relaxed) {
            return None;
        }
        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                return None;
            }
        }
        match operator_input.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => return Some(line),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => return None,
        }
    }
}

// Returns false if control-c arrived first.
fn wait_unless_signalled(duration: Duration, got_signal: &AtomicBool) -> bool {
    let start = Instant::now();
    while start.elapsed() < duration {
        if got_signal.load(AtomicOrdering::Relaxed) {
            return false;
        }
        thread::sleep(Duration::from_millis(200));
    }
    !got_signal.load(AtomicOrdering::Relaxed)
}
