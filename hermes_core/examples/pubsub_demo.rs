//! Two nodes exchanging sensor readings over the bus.
//!
//! Run a second copy of this example in another terminal to watch the same
//! traffic flow across processes through the shared-memory fabric.

use hermes_core::{HermesResult, Node};
use std::sync::Arc;
use std::time::Duration;

fn main() -> HermesResult<()> {
    // Pid-suffixed ids keep concurrent copies of the demo distinct
    let pid = std::process::id();
    let dashboard = Node::create(&format!("dashboard_{}", pid))?;
    dashboard.subscribe(
        "sensor",
        &["temperature", "pressure"],
        Arc::new(|_group, topic, payload| {
            println!("[dashboard] {}: {}", topic, String::from_utf8_lossy(payload));
        }),
    )?;

    let probe = Node::create(&format!("probe_{}", pid))?;
    for i in 0..10 {
        probe.publish("sensor", "temperature", format!("T={}C", 20 + i % 3).as_bytes())?;
        probe.publish("sensor", "pressure", format!("P={}hPa", 1013 + i).as_bytes())?;
        std::thread::sleep(Duration::from_millis(500));
    }

    // Let the last messages drain before the nodes announce NODE_LEAVE
    std::thread::sleep(Duration::from_millis(200));
    Ok(())
}
