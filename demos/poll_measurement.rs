use dsoxctrl::proto::command::{Channel, MeasurementKind, MeasurementSource, Palette};
use dsoxctrl::{Address, Device, DEFAULT_ADDRESS};
use std::time::Duration;

#[tokio::main]
async fn main() -> dsoxctrl::Result<()> {
    let address: Address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDRESS.to_string())
        .parse()?;
    let mut device = Device::connect(&address).await?;
    println!("Connected to: {}", device.ident().await?);

    let n = device.save_image("screen.png", Palette::Color).await?;
    println!("Saved {} bytes to screen.png", n);

    let source = MeasurementSource::Channel(Channel::new(1)?);
    loop {
        let value = device.measure(MeasurementKind::Frequency, source).await?;
        println!("Value: {}", value);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
