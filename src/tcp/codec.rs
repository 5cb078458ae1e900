//! The Segment Codec (spec §4.3): parsing and serializing the fixed TCP
//! header plus the small option set this crate recognizes (MSS, NOP, Window
//! Scale, END). Byte order is network (big-endian) throughout, per spec §6.
//!
//! The checksum field is written as zero by [`encode`] and never validated
//! by [`decode`] — checksum insertion/validation belongs to the IP sender
//! and IP receiver collaborators (spec §1, §6), not to this core.

use crate::error::DecodeError;
use crate::tcp::Flags;

pub const HEADER_LEN: usize = 20;
pub const MAX_OPTIONS_LEN: usize = 40;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WINDOW_SCALE: u8 = 3;

/// The fixed TCP header fields (spec §6), independent of options/payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: Flags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

/// A parsed option. Unknown kinds are skipped during decode rather than
/// represented here (spec §4.3, Scenario F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOption {
    MaxSegmentSize(u16),
    WindowScale(u8),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(pub Vec<TcpOption>);

impl Options {
    pub fn mss(&self) -> Option<u16> {
        self.0.iter().find_map(|o| match o {
            TcpOption::MaxSegmentSize(v) => Some(*v),
            _ => None,
        })
    }

    pub fn window_scale(&self) -> Option<u8> {
        self.0.iter().find_map(|o| match o {
            TcpOption::WindowScale(v) => Some(*v),
            _ => None,
        })
    }
}

/// A transient decoded segment: the contract says these never outlive a
/// single State Machine transition, so the payload borrows from the caller's
/// buffer rather than being copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    pub header: Header,
    pub options: Options,
    pub payload: &'a [u8],
}

impl<'a> Segment<'a> {
    /// Segment length per RFC 793 §3.3: payload bytes plus one each for SYN
    /// and FIN (the "virtual" bytes those flags occupy in sequence space).
    pub fn seg_len(&self) -> u32 {
        self.payload.len() as u32
            + self.header.flags.contains(Flags::SYN) as u32
            + self.header.flags.contains(Flags::FIN) as u32
    }
}

fn read_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Decodes a byte range into a [`Segment`]. `expected_length` is the total
/// number of bytes this segment is supposed to occupy (e.g. taken from the
/// IP payload length); bytes beyond it are ignored, and a shorter buffer is
/// rejected with `BadLength`.
pub fn decode(bytes: &[u8], expected_length: usize) -> Result<Segment<'_>, DecodeError> {
    if bytes.len() < expected_length || expected_length < HEADER_LEN {
        return Err(DecodeError::BadLength);
    }
    let bytes = &bytes[..expected_length];

    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::BadOffset);
    }

    let src_port = read_u16(&bytes[0..2]);
    let dst_port = read_u16(&bytes[2..4]);
    let seq = read_u32(&bytes[4..8]);
    let ack = read_u32(&bytes[8..12]);
    let data_offset_byte = bytes[12];
    let data_offset = (data_offset_byte >> 4) as usize;
    let flags_byte = bytes[13];
    let window = read_u16(&bytes[14..16]);
    let checksum = read_u16(&bytes[16..18]);
    let urgent_ptr = read_u16(&bytes[18..20]);

    if data_offset < 5 {
        return Err(DecodeError::BadOffset);
    }
    let header_len = data_offset * 4;
    if header_len > bytes.len() {
        return Err(DecodeError::BadOffset);
    }

    let options_bytes = &bytes[HEADER_LEN..header_len];
    let options = decode_options(options_bytes)?;

    let header = Header {
        src_port,
        dst_port,
        seq,
        ack,
        flags: Flags::from_bits_truncate(flags_byte),
        window,
        checksum,
        urgent_ptr,
    };

    Ok(Segment {
        header,
        options,
        payload: &bytes[header_len..],
    })
}

fn decode_options(buf: &[u8]) -> Result<Options, DecodeError> {
    let mut opts = Vec::new();
    let mut i = 0;

    while i < buf.len() {
        let kind = buf[i];

        if kind == OPT_END {
            break;
        }
        if kind == OPT_NOP {
            i += 1;
            continue;
        }

        if i + 1 >= buf.len() {
            return Err(DecodeError::BadOption);
        }
        let len = buf[i + 1] as usize;
        if len < 2 || i + len > buf.len() {
            return Err(DecodeError::BadOption);
        }

        match kind {
            OPT_MSS => {
                if len != 4 {
                    return Err(DecodeError::BadOption);
                }
                opts.push(TcpOption::MaxSegmentSize(read_u16(&buf[i + 2..i + 4])));
            }
            OPT_WINDOW_SCALE => {
                if len != 3 {
                    return Err(DecodeError::BadOption);
                }
                opts.push(TcpOption::WindowScale(buf[i + 2]));
            }
            _ => {
                // Unrecognized kind (e.g. SACK-permitted, Timestamps):
                // skip by its declared length (spec §4.3, Scenario F).
            }
        }

        i += len;
    }

    Ok(Options(opts))
}

/// Serializes a header, option list and payload into one segment buffer.
/// Options are padded to a 4-byte boundary with NOPs, terminated with an
/// END byte only when padding is otherwise needed. The checksum field is
/// always written as zero; the IP sender computes and inserts it.
pub fn encode(header: &Header, options: &Options, payload: &[u8]) -> Vec<u8> {
    let mut opt_bytes = Vec::new();
    for opt in &options.0 {
        match opt {
            TcpOption::MaxSegmentSize(mss) => {
                opt_bytes.push(OPT_MSS);
                opt_bytes.push(4);
                opt_bytes.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOption::WindowScale(shift) => {
                opt_bytes.push(OPT_WINDOW_SCALE);
                opt_bytes.push(3);
                opt_bytes.push(*shift);
            }
        }
    }

    let pad = (4 - (opt_bytes.len() % 4)) % 4;
    if pad == 1 {
        opt_bytes.push(OPT_END);
    } else if pad > 1 {
        opt_bytes.push(OPT_END);
        for _ in 1..pad {
            opt_bytes.push(OPT_NOP);
        }
    }
    debug_assert_eq!(opt_bytes.len() % 4, 0);
    debug_assert!(opt_bytes.len() <= MAX_OPTIONS_LEN);

    let data_offset = ((HEADER_LEN + opt_bytes.len()) / 4) as u8;

    let mut out = Vec::with_capacity(HEADER_LEN + opt_bytes.len() + payload.len());
    out.extend_from_slice(&header.src_port.to_be_bytes());
    out.extend_from_slice(&header.dst_port.to_be_bytes());
    out.extend_from_slice(&header.seq.to_be_bytes());
    out.extend_from_slice(&header.ack.to_be_bytes());
    out.push(data_offset << 4);
    out.push(header.flags.bits());
    out.extend_from_slice(&header.window.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // checksum, filled in by IP sender
    out.extend_from_slice(&header.urgent_ptr.to_be_bytes());
    out.extend_from_slice(&opt_bytes);
    out.extend_from_slice(payload);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_header() -> Header {
        Header {
            src_port: 4242,
            dst_port: 80,
            seq: 1000,
            ack: 2000,
            flags: Flags::SYN | Flags::ACK,
            window: 8192,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    #[test]
    fn round_trips_header_with_no_options() {
        let header = base_header();
        let payload = b"hello";
        let encoded = encode(&header, &Options::default(), payload);

        let decoded = decode(&encoded, encoded.len()).unwrap();
        assert_eq!(decoded.header.src_port, header.src_port);
        assert_eq!(decoded.header.dst_port, header.dst_port);
        assert_eq!(decoded.header.seq, header.seq);
        assert_eq!(decoded.header.ack, header.ack);
        assert_eq!(decoded.header.flags, header.flags);
        assert_eq!(decoded.header.window, header.window);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn round_trips_mss_and_window_scale_options() {
        let header = base_header();
        let options = Options(vec![
            TcpOption::MaxSegmentSize(1460),
            TcpOption::WindowScale(7),
        ]);
        let encoded = encode(&header, &options, &[]);

        let decoded = decode(&encoded, encoded.len()).unwrap();
        assert_eq!(decoded.options.mss(), Some(1460));
        assert_eq!(decoded.options.window_scale(), Some(7));
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn unknown_option_kinds_are_skipped_not_rejected() {
        // MSS=1460, SACK_PERMITTED (kind=4 len=2), TIMESTAMPS (kind=8 len=10), NOP, WSCALE=7
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4242u16.to_be_bytes());
        bytes.extend_from_slice(&80u16.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());

        let mut opts = Vec::new();
        opts.extend_from_slice(&[OPT_MSS, 4]);
        opts.extend_from_slice(&1460u16.to_be_bytes());
        opts.extend_from_slice(&[4, 2]); // SACK_PERMITTED
        opts.extend_from_slice(&[8, 10]);
        opts.extend_from_slice(&[0u8; 8]); // TIMESTAMPS payload
        opts.push(OPT_NOP);
        opts.extend_from_slice(&[OPT_WINDOW_SCALE, 3, 7]);
        while opts.len() % 4 != 0 {
            opts.push(OPT_NOP);
        }

        let data_offset = ((HEADER_LEN + opts.len()) / 4) as u8;
        bytes.push(data_offset << 4);
        bytes.push(Flags::SYN.bits());
        bytes.extend_from_slice(&8192u16.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&opts);

        let decoded = decode(&bytes, bytes.len()).unwrap();
        assert_eq!(decoded.options.mss(), Some(1460));
        assert_eq!(decoded.options.window_scale(), Some(7));
    }

    #[test]
    fn rejects_data_offset_below_minimum() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[12] = 4 << 4; // data offset = 4, below the minimum of 5
        assert_eq!(decode(&bytes, bytes.len()), Err(DecodeError::BadOffset));
    }

    #[test]
    fn rejects_truncated_option() {
        let mut bytes = vec![0u8; HEADER_LEN + 4];
        bytes[12] = 6 << 4;
        bytes[HEADER_LEN] = OPT_MSS;
        bytes[HEADER_LEN + 1] = 4;
        // only 2 bytes remain in a 4-byte options area for a len=4 option
        assert_eq!(decode(&bytes, bytes.len()), Err(DecodeError::BadOption));
    }

    #[test]
    fn rejects_buffer_shorter_than_expected_length() {
        let bytes = vec![0u8; HEADER_LEN];
        assert_eq!(decode(&bytes, HEADER_LEN + 4), Err(DecodeError::BadLength));
    }
}
