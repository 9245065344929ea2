//! WiMAX MAC simulation across link conditions

use anyhow::Result;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use wimax_sim::scenarios::{self, BS_ADDRESS};
use wimax_sim::{ScenarioReport, SimulationPresets};

fn print_report(report: &ScenarioReport) {
    let ratio = report.delivery_ratio() * 100.0;
    let ratio = if ratio >= 99.0 {
        format!("{ratio:.1}%").bright_green()
    } else if ratio >= 90.0 {
        format!("{ratio:.1}%").bright_yellow()
    } else {
        format!("{ratio:.1}%").bright_red()
    };
    println!("  {}", report.name.bold());
    println!("    delivered:      {}/{} SDUs ({ratio})", report.delivered, report.offered);
    println!("    duplicates:     {}", report.duplicates);
    println!("    payload bytes:  {}", report.delivered_bytes);
    println!(
        "    link:           {} bursts, {} lost, {} bytes on air",
        report.link.frames_sent, report.link.frames_dropped, report.link.bytes_sent
    );
    println!(
        "    MAC:            {} management messages, {} abandoned transactions",
        report.management_messages(),
        report.abandoned_transactions()
    );
    println!("    ARQ:            {} blocks retransmitted", report.retransmissions());
    println!("    simulated time: {:?}", report.elapsed);
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    println!("{}", "WiMAX MAC Simulation".bright_blue().bold());
    println!("{}", "====================".bright_blue());
    println!("base station {}", hex::encode(BS_ADDRESS));
    println!();

    let presets = SimulationPresets::all();
    let progress = ProgressBar::new(presets.len() as u64 * 2);
    progress.set_style(ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")?);

    let mut reports = Vec::new();
    for (name, config) in presets {
        progress.set_message(name);
        let uplink = scenarios::cbr_uplink(&config).await?;
        progress.inc(1);
        let multicast = scenarios::multicast_downlink(&config).await?;
        progress.inc(1);
        reports.push((name, config, [uplink, multicast]));
    }
    progress.finish_and_clear();

    for (name, config, runs) in &reports {
        println!("{}", format!(">>> {name}").bright_green().bold());
        println!(
            "Link: {} bytes burst, {}% loss, {:?} latency (±{:?}), ARQ {}",
            config.link.mtu,
            (config.link.packet_loss * 100.0) as u32,
            config.link.latency,
            config.link.latency_jitter,
            if config.mac.arq_enabled { "on" } else { "off" }
        );
        println!(
            "Traffic: {} subscribers, {} packets of {} bytes every {:?}",
            config.subscribers, config.packets, config.payload_len, config.packet_interval
        );
        for run in runs {
            print_report(run);
        }
        println!("{}", "-".repeat(50));
    }

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}
