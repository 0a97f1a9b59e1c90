mod logging;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use rh205_lib::adapters::{Axis, CalibrationParams, DataDetailQuery, DataListQuery, DataListSummary, SampleParams};
use rh205_lib::analysis::{self, AnalysisConfig, NoDsp, Statistic};
use rh205_lib::sim::{self, SimConfig, SimulatedSensor};
use rh205_lib::{FirmwareImage, Session, SessionConfig, SessionEvent};

use logging::setup_logging;

/// Drive an RH205 vibration/temperature node over the protocol engine.
///
/// The node is simulated in-process; fault injection flags reproduce lossy radio links.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Print results as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,
    /// Ratio of sampling rate to analysis bandwidth.
    #[arg(long, global = true, default_value_t = 2.5)]
    freq_coefficient: f32,
    /// Pause before each firmware chunk, in milliseconds.
    #[arg(long, global = true, default_value_t = 200)]
    chunk_interval_ms: u64,
    /// Download chunks the simulated radio loses once (comma separated).
    #[arg(long, global = true, value_delimiter = ',')]
    drop_chunks: Vec<usize>,
    /// Firmware chunks the simulated radio loses once (comma separated).
    #[arg(long, global = true, value_delimiter = ',')]
    drop_upload: Vec<usize>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List nearby sensors.
    Scan {
        #[arg(long, default_value_t = 3000)]
        window_ms: u64,
    },
    /// Run the node's self-test.
    SelfCheck,
    /// Read the system parameters.
    SystemParams,
    /// Rename the node's Bluetooth advertisement.
    SetName { name: String },
    /// Capture and download a vibration waveform.
    Sample {
        /// Length in units of 1024 points.
        #[arg(long, default_value_t = 1)]
        len_k: u16,
        /// Analysis bandwidth in units of 100 Hz.
        #[arg(long, default_value_t = 5)]
        freq: u16,
        #[arg(long, value_enum, default_value_t = AxisArg::Z)]
        axis: AxisArg,
        /// Print the raw samples as hex.
        #[arg(long)]
        dump: bool,
    },
    /// Read the infrared temperature.
    Temperature {
        #[arg(long, default_value_t = 0.97)]
        emissivity: f32,
    },
    /// Stop an ongoing capture.
    Stop,
    /// Calibrate an axis against a reference excitation.
    Calibrate {
        #[arg(long, default_value_t = 1)]
        len_k: u16,
        #[arg(long, default_value_t = 5)]
        freq: u16,
        #[arg(long, value_enum, default_value_t = AxisArg::Z)]
        axis: AxisArg,
        /// Reference amplitude in g.
        #[arg(long, default_value_t = 1.0)]
        reference_g: f32,
    },
    /// Summarize captures stored on the node.
    Records {
        /// How far back to look.
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Download a stored capture.
    FetchRecord {
        id: u32,
        /// Stored length in bytes.
        #[arg(long, default_value_t = 2048)]
        len: u32,
    },
    /// Upload a firmware image.
    Upgrade {
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        transfer_id: u32,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum AxisArg {
    Z,
    X,
    Y,
}

impl From<AxisArg> for Axis {
    fn from(axis: AxisArg) -> Self {
        match axis {
            AxisArg::Z => Axis::Z,
            AxisArg::X => Axis::X,
            AxisArg::Y => Axis::Y,
        }
    }
}

#[derive(Serialize)]
struct WaveformSummary {
    bytes: usize,
    chunks: usize,
    elapsed_ms: u128,
    rms_g: f64,
    peak_g: f64,
    peak_to_peak_g: f64,
    kurtosis: f64,
    duration_s: f64,
}

/// Stored record the simulated node holds, numbered 1.
const STORED_RECORD: u32 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("Command failed: {:?}", e);
        process::exit(1);
    }

    Ok(())
}

fn simulated_node(cli: &Cli) -> SimConfig {
    let stored_at = Utc::now() - TimeDelta::days(2);
    let mut config = SimConfig::default()
        .disconnected()
        .drop_download_once(cli.drop_chunks.iter().copied())
        .drop_upload_once(cli.drop_upload.iter().copied())
        .with_record(STORED_RECORD, sim::waveform(1024));
    config.data_list = DataListSummary {
        count: 1,
        oldest: Some(stored_at),
        newest: Some(stored_at),
    };
    config
}

/// Log session events as they arrive.
fn spawn_event_logger(mut events: UnboundedReceiver<SessionEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::DeviceFound(device) => {
                    info!(id = %device.id, rssi = device.rssi, "Found {}", device.name.as_deref().unwrap_or(""))
                }
                SessionEvent::ChunksMissing { total, missing } => {
                    warn!("{}/{} chunks missing: {:?}", missing.len(), total, missing)
                }
                SessionEvent::RetransmitRound { round, missing } => {
                    warn!("Retransmission round {round}: {:?}", missing)
                }
                SessionEvent::UpgradeProgress(progress) => {
                    info!(
                        "Firmware {}/{} ({:.2} B/ms)",
                        progress.written, progress.total, progress.throughput
                    )
                }
                SessionEvent::MalformedResponse { command, error } => warn!("{command}: {error}"),
                other => info!("{other:?}"),
            }
        }
    });
}

fn print<T: Serialize + std::fmt::Debug>(json: bool, value: &T) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{value:#?}");
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let sensor = SimulatedSensor::new(simulated_node(&cli));
    let config = SessionConfig::default()
        .with_freq_coefficient(cli.freq_coefficient)
        .with_chunk_interval(Duration::from_millis(cli.chunk_interval_ms));
    let (session, events) = Session::new(sensor, config);
    spawn_event_logger(events);

    if let Commands::Scan { window_ms } = cli.command {
        let devices = session.scan(Duration::from_millis(window_ms)).await?;
        return print(cli.json, &devices);
    }

    let devices = session.scan(Duration::from_millis(500)).await?;
    let Some(target) = devices.first() else {
        bail!("No RH205 node in range");
    };
    session
        .connect(&target.id)
        .await
        .with_context(|| format!("Failed to connect to {}", target.id))?;

    let result = execute(&session, &cli).await;
    session.disconnect().await?;
    result
}

async fn execute(session: &Session<SimulatedSensor>, cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Scan { .. } => Ok(()),
        Commands::SelfCheck => {
            let report = session.self_check().await?;
            if !report.all_normal() {
                warn!("Self-check reports a faulty component");
            }
            print(cli.json, &report)
        }
        Commands::SystemParams => {
            let params = session.system_params().await?;
            info!("Firmware {}", params.firmware_version());
            print(cli.json, &params)
        }
        Commands::SetName { name } => {
            let mut params = session.system_params().await?;
            params.ble_name = name.clone();
            session.set_system_params(&params).await?;
            print(cli.json, &session.system_params().await?)
        }
        Commands::Sample { len_k, freq, axis, dump } => {
            let params = SampleParams::new(*len_k, *freq, (*axis).into());
            let waveform = session.sample(params).await?;
            if *dump {
                println!("{}", hex::encode(&waveform.data));
            }
            let config = AnalysisConfig::for_capture(&params, cli.freq_coefficient)?;
            let staged = analysis::analyze(&waveform.data, &config, &NoDsp)?;
            let summary = WaveformSummary {
                bytes: waveform.data.len(),
                chunks: waveform.chunks,
                elapsed_ms: waveform.elapsed.as_millis(),
                rms_g: staged.rms(),
                peak_g: staged.peak(),
                peak_to_peak_g: staged.statistic(Statistic::PeakToPeak),
                kurtosis: staged.kurtosis(),
                duration_s: staged.x_max(),
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "{} bytes in {} chunks ({} ms)",
                    summary.bytes, summary.chunks, summary.elapsed_ms
                );
                println!("  RMS:          {:.4} g", summary.rms_g);
                println!("  Peak:         {:.4} g", summary.peak_g);
                println!("  Peak-to-peak: {:.4} g", summary.peak_to_peak_g);
                println!("  Kurtosis:     {:.3}", summary.kurtosis);
                println!("  Duration:     {:.3} s", summary.duration_s);
            }
            Ok(())
        }
        Commands::Temperature { emissivity } => print(cli.json, &session.sample_temperature(*emissivity).await?),
        Commands::Stop => {
            session.stop_sampling().await?;
            info!("Sampling stopped");
            Ok(())
        }
        Commands::Calibrate {
            len_k,
            freq,
            axis,
            reference_g,
        } => {
            let params = CalibrationParams {
                len_k: *len_k,
                freq: *freq,
                axis: (*axis).into(),
                reference_g: *reference_g,
            };
            print(cli.json, &session.calibrate(params).await?)
        }
        Commands::Records { days } => {
            let to = Utc::now();
            let from = to - TimeDelta::try_days(*days).context("Look-back window out of range")?;
            print(cli.json, &session.data_list(DataListQuery { from, to }).await?)
        }
        Commands::FetchRecord { id, len } => {
            let waveform = session
                .fetch_record(DataDetailQuery {
                    record: *id,
                    data_len: *len,
                })
                .await?;
            info!("Record {id}: {} bytes in {:?}", waveform.data.len(), waveform.elapsed);
            println!("{}", hex::encode(&waveform.data));
            Ok(())
        }
        Commands::Upgrade { file, transfer_id } => {
            let data = std::fs::read(file).with_context(|| format!("Failed to read firmware image {:?}", file))?;
            let image = FirmwareImage::new(*transfer_id, Bytes::from(data));
            let report = session.upgrade(image).await?;
            print(cli.json, &report)
        }
    }
}
