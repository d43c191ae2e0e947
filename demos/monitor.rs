//! Connects to a Bravia Quad, prints every change it reports and exits on Ctrl-C.
//!
//! ```text
//! cargo run --example monitor -- 192.168.1.50
//! ```

use bravia_quad::{BraviaClient, ClientConfig, Feature};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let Some(host) = std::env::args().nth(1) else {
        eprintln!("usage: monitor <host>[:port]");
        std::process::exit(2);
    };

    let client = BraviaClient::new(ClientConfig::default());
    client.connect(&host).await?;
    println!("Connected to {}", host);

    client.refresh_all().await;
    for feature in Feature::ALL.into_iter().filter(|f| f.is_readable()) {
        if let Some(value) = client.current_value(feature) {
            println!("{:<24} {}", feature, value);
        }
    }

    match client.detect_subwoofer().await {
        Ok(present) => println!("Subwoofer: {}", if present { "yes" } else { "no" }),
        Err(e) => println!("Subwoofer detection failed: {}", e),
    }

    let mut changes = client.subscribe_changes();
    let mut state = client.watch_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Some(change) => println!("{:<24} {}", change.feature, change.value),
                None => break,
            },
            Ok(()) = state.changed() => {
                println!("Session: {:?}", *state.borrow_and_update());
            }
        }
    }

    client.close().await;
    Ok(())
}
