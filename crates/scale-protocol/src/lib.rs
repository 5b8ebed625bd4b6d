// scale-protocol: Wire grammar for the scale TCP stream.
//
// Scales speak newline-delimited UTF-8 text.  The first frame on a
// connection is a registration (`SCALE-NN`), heartbeats are the bare token
// `HB`, and weighing events are a fixed five-field `|`-separated record.
// Everything else is classified `Unknown` with the raw line preserved.
//
// This crate is pure: no I/O, no async, and classification never fails —
// unparseable input degrades to `Frame::Unknown`.

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum accepted frame length in bytes, excluding the line terminator.
///
/// A frame of exactly this size is valid; one byte more is a protocol
/// violation and the connection must be closed.
pub const MAX_FRAME_BYTES: usize = 4096;

/// Number of fields in an event line.
const EVENT_FIELD_COUNT: usize = 5;

// ---------------------------------------------------------------------------
// Frame types
// ---------------------------------------------------------------------------

/// A single weighing/print event as carried on the wire.
///
/// Canonical line format (five fields, `|`-separated, no field may contain
/// a pipe):
///
/// ```text
/// <pluCode>|<productName>|<weightGrams>|<barcode>|<scaleTimestamp>
/// ```
///
/// `weight_grams` is a non-negative integer; `scale_timestamp` is carried
/// verbatim (the scale's clock is not trusted or adjusted here).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub plu_code: String,
    pub product_name: String,
    pub weight_grams: u32,
    pub barcode: String,
    pub scale_timestamp: String,
}

/// Classification of one decoded text line from a scale connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `SCALE-NN` — binds the connection to a device id.
    Registration { device_id: String },
    /// `HB`.
    Heartbeat,
    /// A parsed weighing event.
    Event(EventRecord),
    /// Anything else; the raw line is kept for observability.
    Unknown { raw: String },
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify one decoded line.
///
/// The line is trimmed before matching, so CR/LF remnants and padding do
/// not affect classification.  Never panics and never performs I/O.
pub fn parse_frame(line: &str) -> Frame {
    let trimmed = line.trim();

    if is_registration(trimmed) {
        return Frame::Registration {
            device_id: trimmed.to_owned(),
        };
    }

    if trimmed == "HB" {
        return Frame::Heartbeat;
    }

    match parse_event_line(trimmed) {
        Some(record) => Frame::Event(record),
        None => Frame::Unknown {
            raw: line.to_owned(),
        },
    }
}

/// True if the entire string is a registration token: `SCALE-` followed by
/// exactly two ASCII decimal digits.
pub fn is_registration(s: &str) -> bool {
    let Some(digits) = s.strip_prefix("SCALE-") else {
        return false;
    };
    digits.len() == 2 && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Parse an event line against the canonical grammar.
///
/// Returns `None` on any deviation: wrong field count, empty PLU code,
/// or a weight that is not a non-negative integer.
pub fn parse_event_line(line: &str) -> Option<EventRecord> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() != EVENT_FIELD_COUNT {
        return None;
    }

    let plu_code = fields[0];
    if plu_code.is_empty() {
        return None;
    }

    let weight_grams: u32 = fields[2].parse().ok()?;

    Some(EventRecord {
        plu_code: plu_code.to_owned(),
        product_name: fields[1].to_owned(),
        weight_grams,
        barcode: fields[3].to_owned(),
        scale_timestamp: fields[4].to_owned(),
    })
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Error for [`format_event_line`]: a field contains the delimiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimiterInField {
    pub field: &'static str,
}

impl std::fmt::Display for DelimiterInField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event field '{}' contains '|'", self.field)
    }
}

impl std::error::Error for DelimiterInField {}

/// Serialize an event record to its canonical line.
///
/// Inverse of [`parse_event_line`]: for every record this function accepts,
/// `parse_event_line(&format_event_line(r)?) == Some(r)`.
pub fn format_event_line(record: &EventRecord) -> Result<String, DelimiterInField> {
    for (name, value) in [
        ("plu_code", record.plu_code.as_str()),
        ("product_name", record.product_name.as_str()),
        ("barcode", record.barcode.as_str()),
        ("scale_timestamp", record.scale_timestamp.as_str()),
    ] {
        if value.contains('|') {
            return Err(DelimiterInField { field: name });
        }
    }
    if record.plu_code.is_empty() {
        return Err(DelimiterInField { field: "plu_code" });
    }

    Ok(format!(
        "{}|{}|{}|{}|{}",
        record.plu_code,
        record.product_name,
        record.weight_grams,
        record.barcode,
        record.scale_timestamp,
    ))
}
