//! BER/DER framing: tag/length header codec. No value interpretation.

use crate::error::{Asn1Error, Result};
use crate::tag::{Tag, TagClass};
use std::io::Read;

/// Content length of a TLV.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Length {
    Definite(usize),
    Indefinite,
}

impl Length {
    /// Definite length, or an error where only definite lengths are legal.
    pub fn definite(self) -> Result<usize> {
        match self {
            Length::Definite(n) => Ok(n),
            Length::Indefinite => Err(Asn1Error::InvalidLengthEncoding),
        }
    }
}

/// One decoded tag/length header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TlHeader {
    pub class: TagClass,
    pub number: u32,
    pub constructed: bool,
    /// Number of header octets.
    pub nhdr: usize,
    pub length: Length,
}

impl TlHeader {
    pub fn tag(&self) -> Tag {
        Tag {
            class: self.class,
            number: self.number,
        }
    }

    /// True for the `00 00` end-of-contents marker.
    pub fn is_end_of_contents(&self) -> bool {
        self.class == TagClass::Universal
            && self.number == 0
            && !self.constructed
            && self.length == Length::Definite(0)
    }
}

/// Decodes the header starting at `buf[pos]`.
pub fn read_tl(buf: &[u8], pos: usize) -> Result<TlHeader> {
    let mut cur = pos;
    let mut next = |err: Asn1Error| -> Result<u8> {
        let b = *buf.get(cur).ok_or(err)?;
        cur += 1;
        Ok(b)
    };

    let first = next(Asn1Error::Truncated)?;
    let class = TagClass::from_octet(first);
    let constructed = first & 0x20 != 0;
    let number = if first & 0x1F == 0x1F {
        read_high_tag_number(&mut next)?
    } else {
        u32::from(first & 0x1F)
    };

    let length = read_length(&mut next)?;
    Ok(TlHeader {
        class,
        number,
        constructed,
        nhdr: cur - pos,
        length,
    })
}

/// Streaming twin of [`read_tl`]. A clean end of stream before the first
/// octet is `Eof`; anything shorter than a full header is `Truncated`.
pub fn read_tl_from(reader: &mut dyn Read) -> Result<TlHeader> {
    let mut nhdr = 0usize;
    let mut one = [0u8; 1];

    let n = reader.read(&mut one).map_err(Asn1Error::from_read)?;
    if n == 0 {
        return Err(Asn1Error::Eof);
    }
    nhdr += 1;
    let first = one[0];

    let mut next = |err: Asn1Error| -> Result<u8> {
        let mut b = [0u8; 1];
        match reader.read(&mut b).map_err(Asn1Error::from_read)? {
            0 => Err(err),
            _ => {
                nhdr += 1;
                Ok(b[0])
            }
        }
    };

    let class = TagClass::from_octet(first);
    let constructed = first & 0x20 != 0;
    let number = if first & 0x1F == 0x1F {
        read_high_tag_number(&mut next)?
    } else {
        u32::from(first & 0x1F)
    };
    let length = read_length(&mut next)?;

    Ok(TlHeader {
        class,
        number,
        constructed,
        nhdr,
        length,
    })
}

fn read_high_tag_number(next: &mut dyn FnMut(Asn1Error) -> Result<u8>) -> Result<u32> {
    let mut number: u32 = 0;
    let mut first = true;
    loop {
        let b = next(Asn1Error::Truncated)?;
        if first && b == 0x80 {
            // non-minimal leading octet
            return Err(Asn1Error::ReservedTag);
        }
        first = false;
        if number > (u32::MAX >> 7) {
            return Err(Asn1Error::ReservedTag);
        }
        number = (number << 7) | u32::from(b & 0x7F);
        if b & 0x80 == 0 {
            return Ok(number);
        }
    }
}

fn read_length(next: &mut dyn FnMut(Asn1Error) -> Result<u8>) -> Result<Length> {
    let first = next(Asn1Error::Truncated)?;
    if first == 0x80 {
        return Ok(Length::Indefinite);
    }
    if first < 0x80 {
        return Ok(Length::Definite(first as usize));
    }
    if first == 0xFF {
        return Err(Asn1Error::InvalidLengthEncoding);
    }
    let count = (first & 0x7F) as usize;
    if count > std::mem::size_of::<usize>() {
        return Err(Asn1Error::InvalidLengthEncoding);
    }
    let mut len: usize = 0;
    for _ in 0..count {
        let b = next(Asn1Error::Truncated)?;
        len = (len << 8) | b as usize;
    }
    Ok(Length::Definite(len))
}

/// Encodes one tag/length header onto `out`.
///
/// `Length::Indefinite` requires `constructed` and emits the `0x80` length
/// octet; the matching end-of-contents marker is a plain
/// `write_tl(out, Universal, 0, false, Definite(0))`, see [`write_end_tag`].
pub fn write_tl(out: &mut Vec<u8>, class: TagClass, number: u32, constructed: bool, length: Length) {
    let mut first = class.bits();
    if constructed {
        first |= 0x20;
    }
    if number < 0x1F {
        out.push(first | number as u8);
    } else {
        out.push(first | 0x1F);
        let mut shift = (31 - number.leading_zeros()) / 7 * 7;
        loop {
            let septet = ((number >> shift) & 0x7F) as u8;
            if shift == 0 {
                out.push(septet);
                break;
            }
            out.push(septet | 0x80);
            shift -= 7;
        }
    }

    match length {
        Length::Indefinite => out.push(0x80),
        Length::Definite(len) if len < 0x80 => out.push(len as u8),
        Length::Definite(len) => {
            let nbytes = (usize::BITS - len.leading_zeros()).div_ceil(8) as usize;
            out.push(0x80 | nbytes as u8);
            for i in (0..nbytes).rev() {
                out.push((len >> (8 * i)) as u8);
            }
        }
    }
}

/// Writes the `00 00` end-of-contents marker closing one indefinite length.
pub fn write_end_tag(out: &mut Vec<u8>) {
    write_tl(out, TagClass::Universal, 0, false, Length::Definite(0));
}

/// Number of octets `write_tl` emits for this tag and length.
pub fn tl_len(number: u32, length: Length) -> usize {
    let tag_len = if number < 0x1F {
        1
    } else {
        1 + (1 + (31 - number.leading_zeros()) / 7) as usize
    };
    let len_len = match length {
        Length::Indefinite => 1,
        Length::Definite(len) if len < 0x80 => 1,
        Length::Definite(len) => 1 + (usize::BITS - len.leading_zeros()).div_ceil(8) as usize,
    };
    tag_len + len_len
}
