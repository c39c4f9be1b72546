use std::io::Write as _;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::Level;
use pbr::{ProgressBar, Units};

use usbh_tft::commands::{
    AnimationControlCommand, ClearScreenCommand, InitDisplayCommand, InquiryCommand, InquiryData,
    TestUnitReadyCommand,
};
use usbh_tft::{DataRequest, ExecuteOptions, Transport, TransportConfig};

mod display;

/// Default identity of the panel this CLI drives.
const VENDOR_ID: u16 = 0x0402;
const PRODUCT_ID: u16 = 0x3922;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Opts {
    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enumerate candidate devices matching the panel's vendor/product ID.
    List,
    /// Open the device, run INQUIRY, and print its identity and phase.
    Info,
    /// Print transport statistics; with `--watch`, repeat until interrupted.
    Status {
        #[clap(long)]
        watch: bool,
    },
    /// Send the vendor init-display command.
    Init,
    /// Send the vendor clear-screen command.
    Clear,
    /// Enable or disable the panel's own animation.
    Animate {
        #[clap(value_parser = ["on", "off"])]
        state: String,
    },
    /// Decode an image and display it at the given offset.
    Show {
        image: String,
        #[clap(long, default_value_t = 0)]
        x: u16,
        #[clap(long, default_value_t = 0)]
        y: u16,
    },
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.verbose {
        env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                if record.level() == Level::Info {
                    writeln!(buf, "{}", record.args())
                } else {
                    writeln!(buf, "{}: {}", record.level(), record.args())
                }
            })
            .init();
    }

    match opts.command {
        Command::List => cmd_list(),
        Command::Info => cmd_info(),
        Command::Status { watch } => cmd_status(watch),
        Command::Init => cmd_init(),
        Command::Clear => cmd_clear(),
        Command::Animate { state } => cmd_animate(state == "on"),
        Command::Show { image, x, y } => cmd_show(&image, x, y),
    }
}

fn open() -> Result<Transport> {
    Transport::open(VENDOR_ID, PRODUCT_ID, TransportConfig::default())
        .with_context(|| format!("opening {VENDOR_ID:#06x}:{PRODUCT_ID:#06x}"))
}

fn cmd_list() -> Result<()> {
    // Opening is itself the only enumeration primitive the core exposes;
    // a dedicated scan would duplicate RusbGateway::open's device walk for
    // no benefit, so `list` just reports whether one is reachable.
    match open() {
        Ok(transport) => {
            println!("found {VENDOR_ID:#06x}:{PRODUCT_ID:#06x}, phase {:?}", transport.current_phase());
            transport.close();
        }
        Err(err) => {
            println!("no device matching {VENDOR_ID:#06x}:{PRODUCT_ID:#06x}: {err}");
        }
    }
    Ok(())
}

fn cmd_info() -> Result<()> {
    let transport = open()?;

    let cmd = InquiryCommand::new(36);
    let outcome = transport
        .execute(&cmd, DataRequest::In(36), ExecuteOptions::default())
        .context("INQUIRY failed")?;

    let bytes = outcome.bytes_in.context("INQUIRY returned no data")?;
    let data = InquiryData::parse(&bytes).context("malformed INQUIRY response")?;

    println!("vendor:  {}", data.vendor());
    println!("product: {}", data.product());
    println!("phase:   {:?}", transport.current_phase());

    transport.close();
    Ok(())
}

fn cmd_status(watch: bool) -> Result<()> {
    let transport = open()?;

    if watch {
        let closer = transport.clone();
        ctrlc::set_handler(move || {
            closer.close();
            std::process::exit(0);
        })
        .context("installing Ctrl-C handler")?;
    }

    loop {
        // A probe keeps the lifecycle machine's observation fresh even if
        // the caller never issues a real command.
        let _ = transport.execute(&TestUnitReadyCommand, DataRequest::None, ExecuteOptions::default());
        let stats = transport.statistics();
        println!(
            "phase={:?} elapsed={:.1}s commands={} successes={} mismatches={} pipe_errors={}",
            stats.phase,
            stats.elapsed_in_phase.as_secs_f32(),
            stats.counters.commands_issued,
            stats.counters.successful_csws,
            stats.counters.tag_mismatches,
            stats.counters.pipe_errors,
        );

        if !watch {
            break;
        }
        std::thread::sleep(Duration::from_secs(1));
    }

    transport.close();
    Ok(())
}

fn cmd_init() -> Result<()> {
    let transport = open()?;
    transport
        .execute(&InitDisplayCommand, DataRequest::None, ExecuteOptions::default())
        .context("init-display failed")?;
    log::info!("display initialized");
    transport.close();
    Ok(())
}

fn cmd_clear() -> Result<()> {
    let transport = open()?;
    transport
        .execute(&ClearScreenCommand, DataRequest::None, ExecuteOptions::default())
        .context("clear-screen failed")?;
    log::info!("display cleared");
    transport.close();
    Ok(())
}

fn cmd_animate(enable: bool) -> Result<()> {
    let transport = open()?;
    let payload = AnimationControlCommand::payload(enable);
    transport
        .execute(&AnimationControlCommand, DataRequest::Out(&payload), ExecuteOptions::default())
        .context("animation-control failed")?;
    log::info!("animation {}", if enable { "enabled" } else { "disabled" });
    transport.close();
    Ok(())
}

fn cmd_show(path: &str, x: u16, y: u16) -> Result<()> {
    let image = image::open(path).with_context(|| format!("decoding {path}"))?;
    let payload = display::assemble_payload(&image, x, y);

    let should_log = log::max_level() >= log::LevelFilter::Info;
    let mut pb = should_log.then(|| {
        let mut pb = ProgressBar::new(payload.len() as u64);
        pb.set_units(Units::Bytes);
        pb
    });

    let transport = open()?;

    // The core has no chunked-transfer primitive; a single `Out` data
    // phase carries the whole payload, so progress here just reports
    // before/after rather than per-chunk.
    if let Some(pb) = pb.as_mut() {
        pb.add(0);
    }

    let cmd = usbh_tft::commands::DisplayImageCommand;
    transport
        .execute(&cmd, DataRequest::Out(&payload), ExecuteOptions::default())
        .context("display-image failed")?;

    if let Some(pb) = pb.as_mut() {
        pb.set(payload.len() as u64);
        pb.finish();
    }

    transport.close();
    Ok(())
}
