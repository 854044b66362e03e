//! Backward LZ decompression, the scheme used for compressed overlays and
//! compressed ARM9 static regions. An 8-byte footer sits at the end of the
//! compressed image: a word holding the encoded length (low 24 bits) and
//! the footer length (high 8 bits), then a word with the size the data
//! grows by when decompressed. Decoding walks both cursors backwards.

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum BlzError {
    #[error("compressed data too short: {0} bytes")]
    TooShort(usize),

    #[error("compressed data footer is inconsistent")]
    BadFooter,

    #[error("compressed data stream is malformed")]
    Malformed,
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, BlzError> {
    let len = data.len();
    if len < 8 {
        return Err(BlzError::TooShort(len));
    }

    let footer = read_u32(data, len - 8);
    let extra = read_u32(data, len - 4) as usize;
    let enc_len = (footer & 0xFFFFFF) as usize;
    let footer_len = (footer >> 24) as usize;

    if enc_len > len || footer_len > enc_len || footer_len < 8 {
        return Err(BlzError::BadFooter);
    }

    let mut out = vec![0u8; len + extra];
    out[..len].copy_from_slice(data);

    let stop = len - enc_len;
    let mut src = len - footer_len;
    let mut dst = out.len();

    while src > stop {
        src -= 1;
        let flags = out[src];

        for bit in 0..8 {
            if flags & (0x80 >> bit) == 0 {
                if src == stop || dst == 0 {
                    return Err(BlzError::Malformed);
                }
                src -= 1;
                dst -= 1;
                out[dst] = out[src];
            } else {
                if src < stop + 2 {
                    return Err(BlzError::Malformed);
                }
                src -= 1;
                let hi = out[src];
                src -= 1;
                let lo = out[src];

                let disp = (((hi as usize & 0xF) << 8) | lo as usize) + 3;
                let count = (hi >> 4) as usize + 3;

                if count > dst || dst + disp > out.len() {
                    return Err(BlzError::Malformed);
                }
                for _ in 0..count {
                    dst -= 1;
                    out[dst] = out[dst + disp];
                }
            }

            if src <= stop {
                break;
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decompress() {
        // Eight literals followed by two chained back-references, yielding
        // the same eight bytes three times over.
        let mut data = vec![
            0x05, 0x50, // second match: count 8, distance 8
            0x05, 0x50, // first match: count 8, distance 8
            0xC0, // flags for the two matches
            0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, // literals
            0x00, // flags for the eight literals
        ];
        data.extend_from_slice(&0x08000016u32.to_le_bytes()); // enc 22, footer 8
        data.extend_from_slice(&2u32.to_le_bytes()); // grows by 2
        assert_eq!(data.len(), 22);

        let out = decompress(&data).unwrap();
        let unit = [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7];
        assert_eq!(out.len(), 24);
        assert_eq!(&out[16..24], &unit);
        assert_eq!(&out[8..16], &unit);
        assert_eq!(&out[0..8], &unit);
    }

    #[test]
    fn test_literals_only() {
        // A single literal token; everything below the encoded region is
        // copied through untouched.
        let mut data = vec![0x10, 0x11, 0x12, 0xAB, 0x00];
        data.extend_from_slice(&0x0800000Au32.to_le_bytes()); // enc 10, footer 8
        data.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(data.len(), 13);

        let out = decompress(&data).unwrap();
        assert_eq!(out.len(), 13);
        assert_eq!(&out[..3], &[0x10, 0x11, 0x12]);
        assert_eq!(out[12], 0xAB);
    }

    #[test]
    fn test_errors() {
        assert_eq!(decompress(&[0; 4]).unwrap_err(), BlzError::TooShort(4));

        let mut data = vec![0u8; 4];
        data.extend_from_slice(&0x08000040u32.to_le_bytes()); // enc 64 > len
        data.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(decompress(&data).unwrap_err(), BlzError::BadFooter);
    }
}
