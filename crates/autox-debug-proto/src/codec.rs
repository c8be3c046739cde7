use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, BufRead, Read, Write};

/// Upper bound on a single frame body.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound on a single header line, including its terminator.
pub const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

const CONTENT_TYPE_PREFIX: &str = "application/vnd.autox-debug.v1+";

/// Serialization used for frame bodies. Both peers must agree on it; every frame advertises
/// its format in a `Content-Type` header so a mismatch is detected on the first frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Bincode,
}

impl WireFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::Bincode => "bincode",
        }
    }

    pub fn content_type(self) -> String {
        format!("{CONTENT_TYPE_PREFIX}{}", self.as_str())
    }

    pub fn encode<T: Serialize>(self, value: &T) -> io::Result<Vec<u8>> {
        match self {
            WireFormat::Json => serde_json::to_vec(value).map_err(|err| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    sanitize_json_error_message(&err.to_string()),
                )
            }),
            WireFormat::Bincode => bincode::serialize(value).map_err(|err| {
                io::Error::new(io::ErrorKind::InvalidData, format!("bincode: {err}"))
            }),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> io::Result<T> {
        match self {
            WireFormat::Json => serde_json::from_slice(bytes).map_err(|err| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    sanitize_json_error_message(&err.to_string()),
                )
            }),
            WireFormat::Bincode => bincode::deserialize(bytes).map_err(|err| {
                io::Error::new(io::ErrorKind::InvalidData, format!("bincode: {err}"))
            }),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WireFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "bincode" => Ok(WireFormat::Bincode),
            other => Err(format!("unknown wire format {other:?}")),
        }
    }
}

fn sanitize_json_error_message(message: &str) -> String {
    // serde_json error strings can echo scalar values from the payload (evaluated expressions,
    // context attributes). Strip quoted values before they reach logs.
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let Some(end) = rest.find('"') else {
            out.push_str(rest);
            return out;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);

    // `unknown field `secret`, expected ...`: keep the expected list, hide the first name.
    if let Some(start) = out.find('`') {
        if let Some(end_rel) = out[start + 1..].find('`') {
            let end = start + 1 + end_rel;
            out.replace_range(start + 1..end, "<redacted>");
        }
    }

    out
}

fn read_line_limited<R: BufRead>(reader: &mut R, max_len: usize) -> io::Result<Option<String>> {
    let mut buf = Vec::<u8>::new();
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let take = newline_pos.map(|pos| pos + 1).unwrap_or(available.len());
        if buf.len() + take > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("debug frame header line exceeds maximum size ({max_len} bytes)"),
            ));
        }

        buf.extend_from_slice(&available[..take]);
        reader.consume(take);
        if newline_pos.is_some() {
            break;
        }
    }

    let line = String::from_utf8(buf).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "debug frame header line is not UTF-8",
        )
    })?;
    Ok(Some(line))
}

/// A frame body together with the format its headers advertised.
#[derive(Debug)]
pub struct RawFrame {
    pub format: Option<WireFormat>,
    pub body: Vec<u8>,
}

/// Read one frame from `reader`.
///
/// Frames use an HTTP-like header section:
///
/// ```text
/// Content-Length: 123\r\n
/// Content-Type: application/vnd.autox-debug.v1+json\r\n
/// \r\n
/// <body>
/// ```
///
/// Returns `Ok(None)` on a clean EOF between frames.
pub fn read_raw_frame<R: BufRead>(reader: &mut R) -> io::Result<Option<RawFrame>> {
    let mut content_length: Option<usize> = None;
    let mut format: Option<WireFormat> = None;
    let mut saw_header_line = false;
    let mut header_error: Option<io::Error> = None;

    loop {
        let Some(line) = read_line_limited(reader, MAX_HEADER_LINE_BYTES)? else {
            if !saw_header_line {
                return Ok(None);
            }

            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF while reading debug frame headers",
            ));
        };
        saw_header_line = true;

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        // Keep consuming headers after a bad one so the stream stays aligned.
        if name.eq_ignore_ascii_case("Content-Length") {
            match value.parse::<usize>() {
                Ok(length) => content_length = Some(length),
                Err(err) => {
                    header_error.get_or_insert_with(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("invalid Content-Length {value:?}: {err}"),
                        )
                    });
                }
            }
        } else if name.eq_ignore_ascii_case("Content-Type") {
            let parsed = match value.strip_prefix(CONTENT_TYPE_PREFIX) {
                Some(suffix) => suffix.parse::<WireFormat>().map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unsupported Content-Type {value:?}: {err}"),
                    )
                }),
                None => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsupported Content-Type {value:?}"),
                )),
            };
            match parsed {
                Ok(parsed) => format = Some(parsed),
                Err(err) => {
                    header_error.get_or_insert(err);
                }
            }
        }
    }

    if let Some(err) = header_error {
        if let Some(length) = content_length.filter(|length| *length <= MAX_FRAME_BYTES) {
            discard_body(reader, length)?;
        }
        return Err(err);
    }

    let Some(content_length) = content_length else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "debug frame missing Content-Length header",
        ));
    };

    if content_length > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "debug frame Content-Length {content_length} exceeds maximum allowed size {MAX_FRAME_BYTES}"
            ),
        ));
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    Ok(Some(RawFrame { format, body }))
}

fn discard_body<R: BufRead>(reader: &mut R, length: usize) -> io::Result<()> {
    let discarded = io::copy(&mut reader.by_ref().take(length as u64), &mut io::sink())?;
    if discarded < length as u64 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "EOF while skipping rejected debug frame body",
        ));
    }
    Ok(())
}

pub fn write_raw_frame<W: Write>(writer: &mut W, format: WireFormat, body: &[u8]) -> io::Result<()> {
    write!(
        writer,
        "Content-Length: {}\r\nContent-Type: {}\r\n\r\n",
        body.len(),
        format.content_type()
    )?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Read and decode one frame, rejecting frames that advertise a different format.
pub fn read_frame<R: BufRead, T: DeserializeOwned>(
    reader: &mut R,
    format: WireFormat,
) -> io::Result<Option<T>> {
    let Some(frame) = read_raw_frame(reader)? else {
        return Ok(None);
    };

    if let Some(advertised) = frame.format {
        if advertised != format {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("wire format mismatch: expected {format}, peer sent {advertised}"),
            ));
        }
    }

    format.decode(&frame.body).map(Some)
}

pub fn write_frame<W: Write, T: Serialize>(
    writer: &mut W,
    format: WireFormat,
    value: &T,
) -> io::Result<()> {
    let body = format.encode(value)?;
    write_raw_frame(writer, format, &body)
}
