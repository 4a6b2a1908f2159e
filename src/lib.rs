//!
//! This library provides communication with a Keysight InfiniiVision
//! DSOX1204G oscilloscope over SCPI.
//!
//! <br>
//!
//! # Details
//!
//! - The instrument is reached either over LAN (raw SCPI socket, port 5025)
//!   or over USB through the Linux `usbtmc` driver (`/dev/usbtmcN`).
//!
//! - Basic setup and connection
//!
//!   ```no_run
//!   use dsoxctrl::{Address, Device};
//!   #[tokio::main]
//!   async fn main() -> dsoxctrl::Result<()> {
//!       let address: Address = "TCPIP0::192.168.1.20::5025::SOCKET".parse()?;
//!       let mut device = Device::connect(&address).await?;
//!       eprintln!("Connected to: {}\n", device.ident().await?.model);
//!       Ok(())
//!   }
//!   ```
//!
//! - Screen images are transferred as IEEE 488.2 binary blocks, see
//!   [`proto::block`].
//!
//! # Supported devices
//!
//!  * Keysight DSOX1204G
//!
//! Most core commands are shared with other InfiniiVision models.
//!

pub mod address;
pub mod device;
pub mod measurement;
pub mod proto;
#[cfg(feature = "visa")]
mod visa;

pub use address::Address;
pub use device::Device;
pub use proto::Result;

/// SCPI socket port of Keysight instruments.
pub const DEFAULT_PORT: u16 = 5025;

#[cfg(unix)]
pub const DEFAULT_ADDRESS: &str = "/dev/usbtmc0";
#[cfg(not(unix))]
pub const DEFAULT_ADDRESS: &str = "TCPIP0::localhost::5025::SOCKET";

/// Environment variable overriding [`DEFAULT_ADDRESS`] in `dsoxcmd`.
pub const ADDRESS_ENV: &str = "DSOX_ADDRESS";
