use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

use crate::address::Address;
use crate::proto::{
    block::{BlockError, TruncationPolicy},
    codec::ProtocolCodec,
    command::{
        normalize_label, Channel, Command, Coupling, LevelSource, MeasurementKind,
        MeasurementSource, Palette, ProbeUnit, Slope, TriggerMode, TriggerSource, VoltUnit,
        WaveFunction,
    },
    response::{parse_float, Ident, Response},
    ProtoError, Result,
};

trait AsyncReadWrite<S>: futures::Sink<S> + futures::Stream {}

impl<T, S> AsyncReadWrite<S> for T where T: futures::Sink<S> + futures::Stream {}

#[allow(clippy::type_complexity)]
pub struct Device {
    stream: Pin<
        Box<
            dyn AsyncReadWrite<
                    Command,
                    Error = std::io::Error,
                    Item = std::result::Result<Response, std::io::Error>,
                > + Send,
        >,
    >,
}

impl Device {
    /// Connect with the default (lenient) block truncation policy.
    pub async fn connect(address: &Address) -> Result<Self> {
        Self::connect_with(address, TruncationPolicy::default()).await
    }

    pub async fn connect_with(address: &Address, policy: TruncationPolicy) -> Result<Self> {
        log::debug!("connecting to {}", address);
        match address {
            Address::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| ProtoError::Connection(format!("{}: {}", address, e)))?;
                stream.set_nodelay(true)?;
                Ok(Self::from_stream(stream, policy))
            }
            Address::UsbTmc { path } => {
                let file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .await
                    .map_err(|e| ProtoError::Connection(format!("{}: {}", address, e)))?;
                Ok(Self::from_stream(file, policy))
            }
            #[cfg(feature = "visa")]
            Address::Visa { resource } => {
                let session = crate::visa::VisaSession::open(resource, policy).await?;
                Ok(Self {
                    stream: Box::pin(session),
                })
            }
        }
    }

    /// Use an already opened byte stream as transport.
    pub fn from_stream<T>(io: T, policy: TruncationPolicy) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let stream = ProtocolCodec::new(policy).framed(io);
        Self {
            stream: Box::pin(stream),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_faked(
        fake: crate::proto::fake::FakeBuffer,
    ) -> (Self, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let written = fake.written();
        (Self::from_stream(fake, TruncationPolicy::default()), written)
    }

    /// Send a command which has no reply.
    pub async fn write(&mut self, cmd: Command) -> Result<()> {
        cmd.validate()?;
        log::debug!("write: {}", cmd);
        self.stream.send(cmd).await?;
        Ok(())
    }

    /// Send a command and wait for its reply, as framed by the codec.
    ///
    /// Replies which could not be decoded are returned as they are
    /// ([`Response::Malformed`], [`Response::Unsolicited`]).
    pub async fn query_raw(&mut self, cmd: Command) -> Result<Response> {
        if cmd.response().is_none() {
            return Err(ProtoError::InvalidArgument(format!(
                "{} has no reply",
                cmd
            )));
        }
        self.write(cmd).await?;
        match self.stream.next().await {
            Some(Ok(response)) => Ok(response),
            Some(Err(ioerr)) => Err(ioerr.into()),
            None => Err(ProtoError::Abort),
        }
    }

    /// Send a command and wait for its reply.
    pub async fn query(&mut self, cmd: Command) -> Result<Response> {
        match self.query_raw(cmd).await? {
            Response::Malformed { error, raw } => {
                log::debug!("malformed reply: {:?}", raw);
                Err(error.into())
            }
            response @ Response::Unsolicited(_) => Err(response.into()),
            response => Ok(response),
        }
    }

    async fn query_text(&mut self, cmd: Command) -> Result<String> {
        match self.query(cmd).await? {
            Response::Text(text) => Ok(text),
            response => Err(response.into()),
        }
    }

    async fn query_block(&mut self, cmd: Command) -> Result<Bytes> {
        match self.query(cmd).await? {
            Response::Block(payload) => Ok(payload),
            response => Err(response.into()),
        }
    }

    /// Query device identification
    pub async fn ident(&mut self) -> Result<Ident> {
        let text = self.query_text(Command::Ident).await?;
        Ok(Ident::try_from(text.as_str())?)
    }

    /// Make sure the expected instrument answers.
    ///
    /// Any failure, including a transport error, is reported as
    /// [`ProtoError::Connection`].
    pub async fn check_ident(&mut self, expected: &str) -> Result<Ident> {
        let text = self
            .query_text(Command::Ident)
            .await
            .map_err(|e| ProtoError::Connection(format!("No identification: {}", e)))?;
        if text.trim() != expected.trim() {
            return Err(ProtoError::Connection(format!(
                "Unexpected instrument: {:?}, expected {:?}",
                text,
                expected.trim()
            )));
        }
        Ok(Ident::try_from(text.as_str())?)
    }

    /// Same as pressing the Single key
    pub async fn single(&mut self) -> Result<()> {
        self.write(Command::Single).await
    }

    /// Same as pressing the Run key
    pub async fn run(&mut self) -> Result<()> {
        self.write(Command::Run).await
    }

    /// Same as pressing the Stop key
    pub async fn stop(&mut self) -> Result<()> {
        self.write(Command::Stop).await
    }

    pub async fn set_channel_coupling(&mut self, ch: Channel, coupling: Coupling) -> Result<()> {
        self.write(Command::ChannelCoupling(ch, coupling)).await
    }

    pub async fn set_channel_display(&mut self, ch: Channel, on: bool) -> Result<()> {
        self.write(Command::ChannelDisplay(ch, on)).await
    }

    pub async fn set_channel_invert(&mut self, ch: Channel, invert: bool) -> Result<()> {
        self.write(Command::ChannelInvert(ch, invert)).await
    }

    /// Set channel label, cut to 10 upper case characters.
    pub async fn set_channel_label(&mut self, ch: Channel, label: &str) -> Result<()> {
        let label = normalize_label(label)?;
        self.write(Command::ChannelLabel(ch, label)).await
    }

    /// Value represented at center screen
    pub async fn set_channel_offset(&mut self, ch: Channel, offset: f64, unit: VoltUnit) -> Result<()> {
        self.write(Command::ChannelOffset(ch, offset, unit)).await
    }

    /// Probe attenuation factor, 0.1 to 10000
    pub async fn set_channel_probe(&mut self, ch: Channel, attenuation: f64) -> Result<()> {
        self.write(Command::ChannelProbe(ch, attenuation)).await
    }

    /// Full-scale vertical range
    pub async fn set_channel_range(&mut self, ch: Channel, range: f64, unit: VoltUnit) -> Result<()> {
        self.write(Command::ChannelRange(ch, range, unit)).await
    }

    /// Vertical units per division
    pub async fn set_channel_scale(&mut self, ch: Channel, scale: f64, unit: VoltUnit) -> Result<()> {
        self.write(Command::ChannelScale(ch, scale, unit)).await
    }

    pub async fn set_channel_units(&mut self, ch: Channel, unit: ProbeUnit) -> Result<()> {
        self.write(Command::ChannelUnits(ch, unit)).await
    }

    /// Show or hide the analog channel labels
    pub async fn set_display_labels(&mut self, on: bool) -> Result<()> {
        self.write(Command::DisplayLabel(on)).await
    }

    /// Fetch the screen as PNG image
    pub async fn screen_image(&mut self, palette: Palette) -> Result<Bytes> {
        let image = self.query_block(Command::DisplayData(palette)).await?;
        log::debug!("received screen image, {} bytes", image.len());
        Ok(image)
    }

    /// Fetch the screen, taking the whole reply as image if its block
    /// header is malformed.
    pub async fn screen_image_or_raw(&mut self, palette: Palette) -> Result<Bytes> {
        match self.query_raw(Command::DisplayData(palette)).await? {
            Response::Block(image) => Ok(image),
            Response::Malformed {
                error: error @ BlockError::Format { .. },
                raw,
            } => {
                log::warn!("using whole reply as image: {}", error);
                Ok(raw)
            }
            Response::Malformed { error, .. } => Err(error.into()),
            response => Err(response.into()),
        }
    }

    /// Save the screen as PNG file, returns the number of bytes written.
    pub async fn save_image(&mut self, path: impl AsRef<Path>, palette: Palette) -> Result<usize> {
        let image = self.screen_image(palette).await?;
        tokio::fs::write(path.as_ref(), &image).await?;
        Ok(image.len())
    }

    /// Remove all measurements and markers from the screen
    pub async fn clear_measurements(&mut self) -> Result<()> {
        self.write(Command::MeasureClear).await
    }

    /// Install a measurement on screen and query its value.
    pub async fn measure(&mut self, kind: MeasurementKind, source: MeasurementSource) -> Result<f64> {
        self.write(Command::MeasureInstall(kind, source)).await?;
        let text = self.query_text(Command::MeasureQuery(kind, source)).await?;
        Ok(parse_float(&text)?)
    }

    /// Horizontal time per division of the main window
    pub async fn set_timebase_scale(&mut self, seconds: f64) -> Result<()> {
        self.write(Command::TimebaseScale(seconds)).await
    }

    pub async fn set_trigger_holdoff(&mut self, seconds: f64) -> Result<()> {
        self.write(Command::TriggerHoldoff(seconds)).await
    }

    pub async fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<()> {
        self.write(Command::TriggerMode(mode)).await
    }

    pub async fn set_trigger_noise_reject(&mut self, on: bool) -> Result<()> {
        self.write(Command::TriggerNoiseReject(on)).await
    }

    /// Trigger level in volts for the given source
    pub async fn set_trigger_level(&mut self, level: f64, source: LevelSource) -> Result<()> {
        self.write(Command::TriggerLevel(level, source)).await
    }

    pub async fn set_trigger_slope(&mut self, slope: Slope) -> Result<()> {
        self.write(Command::TriggerSlope(slope)).await
    }

    pub async fn set_trigger_source(&mut self, source: TriggerSource) -> Result<()> {
        self.write(Command::TriggerSource(source)).await
    }

    pub async fn set_wgen_output(&mut self, on: bool) -> Result<()> {
        self.write(Command::WgenOutput(on)).await
    }

    /// Not used for noise and DC
    pub async fn set_wgen_frequency(&mut self, hertz: f64) -> Result<()> {
        self.write(Command::WgenFrequency(hertz)).await
    }

    pub async fn set_wgen_function(&mut self, function: WaveFunction) -> Result<()> {
        self.write(Command::WgenFunction(function)).await
    }

    pub async fn set_wgen_pulse_width(&mut self, seconds: f64) -> Result<()> {
        self.write(Command::WgenPulseWidth(seconds)).await
    }

    /// Percentage of a ramp cycle which is rising, 0 to 100
    pub async fn set_wgen_ramp_symmetry(&mut self, percent: f64) -> Result<()> {
        self.write(Command::WgenRampSymmetry(percent)).await
    }

    /// Square wave duty cycle, 1 to 99 %
    pub async fn set_wgen_square_duty_cycle(&mut self, percent: f64) -> Result<()> {
        self.write(Command::WgenSquareDutyCycle(percent)).await
    }

    pub async fn set_wgen_amplitude(&mut self, volts: f64) -> Result<()> {
        self.write(Command::WgenAmplitude(volts)).await
    }

    /// Offset voltage or DC level
    pub async fn set_wgen_offset(&mut self, volts: f64) -> Result<()> {
        self.write(Command::WgenOffset(volts)).await
    }

    /// Flush pending commands and release the transport.
    pub async fn close(mut self) -> Result<()> {
        self.stream.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::proto::block::encode;
    use crate::proto::fake::FakeBuffer;

    const IDN: &str = "KEYSIGHT TECHNOLOGIES,DSOX1204G,CN60167508,02.10.2019111333";

    fn written(tx: &std::sync::Arc<std::sync::Mutex<Vec<u8>>>) -> String {
        String::from_utf8(tx.lock().unwrap().clone()).unwrap()
    }

    #[tokio::test]
    async fn test_get_id() {
        let (mut device, tx) = Device::new_faked(FakeBuffer::new(format!("{}\n", IDN).into()));
        let id = device.ident().await.unwrap();
        assert_eq!(id.model, "DSOX1204G");
        assert_eq!(written(&tx), "*IDN?\n");
    }

    #[tokio::test]
    async fn test_check_ident() {
        let (mut device, _) = Device::new_faked(FakeBuffer::new(format!("{}\n", IDN).into()));
        assert!(device.check_ident(&format!("{}\n", IDN)).await.is_ok());
    }

    #[tokio::test]
    async fn test_check_ident_mismatch() {
        let (mut device, _) = Device::new_faked(FakeBuffer::new(
            b"RIGOL TECHNOLOGIES,DS1054Z,DS1ZA000000000,00.04.04\n".to_vec(),
        ));
        assert!(matches!(
            device.check_ident(IDN).await,
            Err(ProtoError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_check_ident_no_reply() {
        let (mut device, _) = Device::new_faked(FakeBuffer::new(Vec::new()));
        assert!(matches!(
            device.check_ident(IDN).await,
            Err(ProtoError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_settings_are_written() {
        let (mut device, tx) = Device::new_faked(FakeBuffer::new(Vec::new()));
        let ch1 = Channel::new(1).unwrap();
        device.stop().await.unwrap();
        device.set_channel_coupling(ch1, Coupling::Dc).await.unwrap();
        device.set_channel_label(ch1, "clock").await.unwrap();
        device.set_channel_scale(ch1, 500.0, VoltUnit::Millivolt).await.unwrap();
        device.set_trigger_mode(TriggerMode::Edge).await.unwrap();
        device.set_wgen_output(true).await.unwrap();
        assert_eq!(
            written(&tx),
            ":STOP\n\
             :CHANnel1:COUPling DC\n\
             :CHANnel1:LABel 'CLOCK'\n\
             :CHANnel1:SCALe 500 mV\n\
             :TRIGger:MODE EDGE\n\
             :WGEN:OUTPut 1\n"
        );
    }

    #[tokio::test]
    async fn test_invalid_argument_is_not_sent() {
        let (mut device, tx) = Device::new_faked(FakeBuffer::new(Vec::new()));
        let ch1 = Channel::new(1).unwrap();
        assert!(matches!(
            device.set_channel_probe(ch1, 20000.0).await,
            Err(ProtoError::InvalidArgument(_))
        ));
        assert!(device.set_wgen_square_duty_cycle(100.0).await.is_err());
        assert!(written(&tx).is_empty());
    }

    #[tokio::test]
    async fn test_measure() {
        let (mut device, tx) = Device::new_faked(FakeBuffer::new(b"+1.00000E+03\n".to_vec()));
        let source = MeasurementSource::Channel(Channel::new(2).unwrap());
        let freq = device
            .measure(MeasurementKind::Frequency, source)
            .await
            .unwrap();
        assert_eq!(freq, 1000.0);
        assert_eq!(
            written(&tx),
            ":MEASure:FREQuency CHANnel2\n:MEASure:FREQuency? CHANnel2\n"
        );
    }

    #[tokio::test]
    async fn test_measure_garbage() {
        let (mut device, _) = Device::new_faked(FakeBuffer::new(b"oops\n".to_vec()));
        assert!(matches!(
            device
                .measure(MeasurementKind::Rms, MeasurementSource::Math)
                .await,
            Err(ProtoError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_screen_image_chunked() {
        let zeros = vec![0u8; 1000];
        let mut wire = b"#41000".to_vec();
        wire.extend_from_slice(&zeros);
        wire.push(b'\n');
        let (mut device, tx) = Device::new_faked(FakeBuffer::new(wire).chunked(64));
        let image = device.screen_image(Palette::Color).await.unwrap();
        assert_eq!(&image[..], &zeros[..]);
        assert_eq!(written(&tx), ":DISPlay:DATA? PNG, COLor\n");
    }

    #[tokio::test]
    async fn test_save_image() {
        let png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec();
        let (mut device, _) = Device::new_faked(FakeBuffer::new(encode(&png).unwrap()));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("screen.png");
        let n = device.save_image(&path, Palette::Grayscale).await.unwrap();
        assert_eq!(n, png.len());
        assert_eq!(std::fs::read(&path).unwrap(), png);
    }

    #[tokio::test]
    async fn test_screen_image_malformed() {
        let (mut device, _) = Device::new_faked(FakeBuffer::new(b"#X12".to_vec()));
        assert!(matches!(
            device.screen_image(Palette::Color).await,
            Err(ProtoError::Format(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_block_does_not_desync() {
        let (mut device, _) = Device::new_faked(FakeBuffer::new(
            format!("#X12\n{}\n{}\n", IDN, IDN).into_bytes(),
        ));
        assert!(matches!(
            device.screen_image(Palette::Color).await,
            Err(ProtoError::Format(_))
        ));
        assert_eq!(device.ident().await.unwrap().serial, "CN60167508");
        assert_eq!(device.ident().await.unwrap().model, "DSOX1204G");
    }

    #[tokio::test]
    async fn test_screen_image_or_raw() {
        let mut wire = b"#X\x89PNG\n".to_vec();
        wire.extend_from_slice(format!("{}\n", IDN).as_bytes());
        let (mut device, _) = Device::new_faked(FakeBuffer::new(wire));
        let image = device.screen_image_or_raw(Palette::Color).await.unwrap();
        assert_eq!(&image[..], b"#X\x89PNG");
        assert_eq!(device.ident().await.unwrap().model, "DSOX1204G");
    }

    #[tokio::test]
    async fn test_query_without_reply_rejected() {
        let (mut device, tx) = Device::new_faked(FakeBuffer::new(Vec::new()));
        assert!(matches!(
            device.query(Command::Run).await,
            Err(ProtoError::InvalidArgument(_))
        ));
        assert!(written(&tx).is_empty());
    }

    #[tokio::test]
    async fn test_screen_image_truncated_lenient() {
        let mut wire = b"#3100".to_vec();
        wire.extend_from_slice(&[5u8; 10]);
        let (mut device, _) = Device::new_faked(FakeBuffer::new(wire));
        let image = device.screen_image(Palette::Color).await.unwrap();
        assert_eq!(&image[..], &[5u8; 10]);
    }

    #[tokio::test]
    async fn test_screen_image_truncated_strict() {
        let mut wire = b"#3100".to_vec();
        wire.extend_from_slice(&[5u8; 10]);
        let mut device = Device::from_stream(FakeBuffer::new(wire), TruncationPolicy::Strict);
        assert!(matches!(
            device.screen_image(Palette::Color).await,
            Err(ProtoError::Truncated {
                declared: 100,
                available: 10
            })
        ));
    }

    #[tokio::test]
    async fn test_connection_closed() {
        let (mut device, _) = Device::new_faked(FakeBuffer::new(Vec::new()));
        assert!(matches!(device.ident().await, Err(ProtoError::Abort)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let address = Address::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        assert!(matches!(
            Device::connect(&address).await,
            Err(ProtoError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_tcp() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut line = String::new();
            socket.read_line(&mut line).await.unwrap();
            assert_eq!(line, "*IDN?\n");
            socket
                .get_mut()
                .write_all(format!("{}\n", IDN).as_bytes())
                .await
                .unwrap();
        });
        let address = Address::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let mut device = Device::connect(&address).await.unwrap();
        assert_eq!(device.ident().await.unwrap().serial, "CN60167508");
        device.close().await.unwrap();
        server.await.unwrap();
    }
}
