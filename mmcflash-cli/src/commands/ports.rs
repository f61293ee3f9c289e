//! Serial port listing.

use anyhow::Result;
use console::style;
use log::warn;
use mmcflash::{NativePortEnumerator, PortEnumerator, PortInfo};

fn discover_ports() -> Vec<PortInfo> {
    NativePortEnumerator::list_ports().unwrap_or_else(|e| {
        warn!("Failed to enumerate serial ports: {e}");
        Vec::new()
    })
}

fn ports_json(ports: &[PortInfo]) -> serde_json::Value {
    let ports: Vec<serde_json::Value> = ports
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "description": p.description,
                "vid": p.vid,
                "pid": p.pid,
            })
        })
        .collect();
    serde_json::json!({
        "ok": true,
        "data": {
            "ports": ports,
        }
    })
}

fn describe(port: &PortInfo) -> String {
    let ids = match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
        _ => String::new(),
    };
    let description = port
        .description
        .as_deref()
        .map(|d| format!(" - {d}"))
        .unwrap_or_default();
    format!("{}{description}{ids}", port.name)
}

/// Print the detected ports to stderr.
pub(crate) fn print_available_ports() {
    let detected = discover_ports();

    eprintln!(
        "{}",
        style("Available serial ports:")
            .bold()
            .underlined()
    );
    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    } else {
        for port in &detected {
            eprintln!("  {} {}", style("•").green(), describe(port));
        }
    }
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ports_json(&discover_ports()))?
        );
        return Ok(());
    }

    print_available_ports();
    Ok(())
}
