use futures_util::SinkExt;
use llmlink_protocol::{Envelope, MAX_LINE_BYTES};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::error::{IpcError, Result};

pub(crate) type LineReader = FramedRead<OwnedReadHalf, LinesCodec>;
pub(crate) type LineWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

pub(crate) fn split(stream: TcpStream) -> (LineReader, LineWriter) {
    let (r, w) = stream.into_split();
    (
        FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
        FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
    )
}

pub(crate) async fn write_envelope(writer: &mut LineWriter, envelope: &Envelope) -> Result<()> {
    let line = envelope.encode()?;
    writer.send(line).await.map_err(codec_error)
}

pub(crate) fn codec_error(err: LinesCodecError) -> IpcError {
    match err {
        LinesCodecError::Io(e) => IpcError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => IpcError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "line exceeds maximum frame size",
        )),
    }
}
