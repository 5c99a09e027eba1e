//! # flutecast - FLUTE/ALC file delivery over lossy UDP
//!
//! A unidirectional, packet-based engine for reliably multicasting files
//! (and append-only streams) with optional forward error correction and a
//! unicast repair side-channel.
//!
//! # RFC
//!
//!| RFC      | Title      | Link       |
//!| ------------- | ------------- | ------------- |
//!| RFC 6726 | FLUTE - File Delivery over Unidirectional Transport | <https://www.rfc-editor.org/rfc/rfc6726.html> |
//!| RFC 5651 | Layered Coding Transport (LCT) Building Block | <https://www.rfc-editor.org/rfc/rfc5651.html> |
//!| RFC 5052 | Forward Error Correction (FEC) Building Block | <https://www.rfc-editor.org/rfc/rfc5052> |
//!| RFC 5053 | Raptor Forward Error Correction Scheme | <https://www.rfc-editor.org/rfc/rfc5053.html> |
//!
//! # Sending files
//!
//!```no_run
//! use flutecast::sender::{Config, Transmitter};
//! use flutecast::telemetry::Telemetry;
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let target = "238.1.1.95:40085".parse().unwrap();
//!     let transmitter = Transmitter::new(target, &Config::default(), Telemetry::new())
//!         .await
//!         .unwrap();
//!     let pump = transmitter.start();
//!
//!     transmitter
//!         .send("file:///hello.txt", "text/plain", 0, 0, b"hello world".to_vec())
//!         .await
//!         .unwrap();
//!
//!     transmitter.set_stop_when_done(true);
//!     pump.await.unwrap();
//! });
//!```
//!
//! # Receiving files
//!
//!```no_run
//! use flutecast::receiver::{Config, Receiver};
//! use flutecast::telemetry::Telemetry;
//! use std::sync::Arc;
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let receiver = Receiver::new(Config::default(), "http://repair.local:8085", Telemetry::new());
//!     receiver.register_completion_callback(Arc::new(|object| {
//!         println!("received {} ({} bytes)",
//!             object.meta().content_location,
//!             object.buffer().map(|b| b.len()).unwrap_or(0));
//!     }));
//!
//!     let socket = tokio::net::UdpSocket::bind("0.0.0.0:40085").await.unwrap();
//!     receiver.start();
//!     receiver.start_socket(socket).await.unwrap();
//! });
//!```

pub mod common;
pub mod fdt;
pub mod fec;
pub mod object;
pub mod receiver;
pub mod recovery;
pub mod sender;
pub mod telemetry;
mod tools;

pub use tools::error::{FluteError, Result};

#[cfg(test)]
mod tests {
    pub fn init() {
        std::env::set_var("RUST_LOG", "debug");
        env_logger::builder().is_test(true).try_init().ok();
    }
}
