use std::env;
use std::sync::{Arc, Mutex};

use hoiax_myuplink::{
    CapabilityValue, HeaterDevice, Host, JsonFileStore, MyUplinkClient, Settings, Trigger,
};

/// Prints what a home-automation host would be told.
#[derive(Default)]
struct PrintHost {
    capabilities: Mutex<Vec<String>>,
}

impl Host for PrintHost {
    fn capabilities(&self) -> Vec<String> {
        self.capabilities.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn add_capability(&self, name: &str) -> hoiax_myuplink::Result<()> {
        println!("+ capability {name}");
        if let Ok(mut caps) = self.capabilities.lock() {
            caps.push(name.to_string());
        }
        Ok(())
    }

    fn remove_capability(&self, name: &str) -> hoiax_myuplink::Result<()> {
        println!("- capability {name}");
        if let Ok(mut caps) = self.capabilities.lock() {
            caps.retain(|c| c != name);
        }
        Ok(())
    }

    fn set_capability_value(&self, name: &str, value: CapabilityValue) {
        println!("{name} = {value:?}");
    }

    fn set_available(&self) {
        println!("available");
    }

    fn set_unavailable(&self, reason: &str) {
        println!("unavailable: {reason}");
    }

    fn set_settings(&self, settings: &Settings) {
        println!("settings: {settings:?}");
    }

    fn trigger(&self, trigger: &Trigger) {
        println!("trigger: {trigger:?}");
    }
}

#[tokio::main]
async fn main() -> hoiax_myuplink::Result<()> {
    tracing_subscriber::fmt::init();

    let token = env::var("MYUPLINK_TOKEN").expect("usage: MYUPLINK_TOKEN=<token> monitor [store.json]");
    let store_path = env::args().nth(1).unwrap_or_else(|| "hoiax-store.json".to_string());

    let client = Arc::new(MyUplinkClient::builder().access_token(token).build()?);
    let devices = client.list_devices(1).await?;
    let device = &devices[0];
    println!(
        "Monitoring {} ({}) in {}",
        device.product_name, device.serial_number, device.system_name
    );

    let store = Arc::new(JsonFileStore::open(&store_path)?);
    let handle = HeaterDevice::new(
        device.device_id.clone(),
        client,
        Arc::new(PrintHost::default()),
        store,
    )
    .spawn();

    let mut status = handle.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let s = status.borrow_and_update().clone();
                println!(
                    "{:?} | {:?} | leak {:.1} W, {:.3} kWh",
                    s.availability,
                    s.state.measured_temperature,
                    s.leak_power_w.unwrap_or_default(),
                    s.leak_kwh.unwrap_or_default(),
                );
            }
        }
    }

    handle.delete();
    handle.join().await;
    Ok(())
}
