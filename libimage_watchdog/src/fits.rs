//! Just enough FITS to store a stack of frames as a single primary HDU.
//!
//! We only ever write one layout: `BITPIX = 8`, `NAXIS = 2`, one row per frame. The reader
//! understands exactly that layout, which is what live analysis and the tests need.
use ndarray::{Array2, ArrayView2};

use super::error::FitsError;

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;
const KEYWORD_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Logical(bool),
    Integer(i64),
    Text(String),
}

impl HeaderValue {
    fn render(&self) -> String {
        match self {
            Self::Logical(value) => format!("{:>20}", if *value { "T" } else { "F" }),
            Self::Integer(value) => format!("{value:>20}"),
            Self::Text(value) => format!("'{:<8}'", value.replace('\'', "''")),
        }
    }

    fn parse(field: &str) -> Option<Self> {
        let field = field.trim_start();
        if let Some(quoted) = field.strip_prefix('\'') {
            // A doubled quote is an escaped quote; a single one closes the string
            let mut text = String::new();
            let mut chars = quoted.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        text.push('\'');
                    } else {
                        break;
                    }
                } else {
                    text.push(c);
                }
            }
            return Some(Self::Text(text.trim_end().to_string()));
        }
        let value = field.split('/').next().unwrap_or_default().trim();
        match value {
            "T" => Some(Self::Logical(true)),
            "F" => Some(Self::Logical(false)),
            _ => value.parse().ok().map(Self::Integer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Card {
    keyword: String,
    value: HeaderValue,
    comment: Option<String>,
}

impl Card {
    fn render(&self) -> Result<String, FitsError> {
        let mut card = format!("{:<8}= {}", self.keyword, self.value.render());
        if card.len() > CARD_SIZE {
            return Err(FitsError::CardTooLong(self.keyword.clone()));
        }
        if let Some(comment) = &self.comment {
            card.push_str(" / ");
            card.push_str(comment);
            card.truncate(CARD_SIZE);
        }
        Ok(format!("{card:<80}"))
    }
}

/// The keyword records of a primary HDU, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FitsHeader {
    cards: Vec<Card>,
}

impl FitsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        keyword: &str,
        value: HeaderValue,
        comment: Option<&str>,
    ) -> Result<(), FitsError> {
        let valid = keyword.len() <= KEYWORD_SIZE
            && keyword
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid || keyword.is_empty() {
            return Err(FitsError::BadKeyword(keyword.to_string()));
        }
        if let HeaderValue::Text(text) = &value {
            if !text.is_ascii() {
                return Err(FitsError::CardTooLong(keyword.to_string()));
            }
        }
        self.cards.push(Card {
            keyword: keyword.to_string(),
            value,
            comment: comment.map(|c| c.chars().filter(|c| c.is_ascii()).collect()),
        });
        Ok(())
    }

    pub fn get(&self, keyword: &str) -> Option<&HeaderValue> {
        self.cards
            .iter()
            .find(|c| c.keyword == keyword)
            .map(|c| &c.value)
    }

    pub fn get_integer(&self, keyword: &'static str) -> Result<i64, FitsError> {
        match self.get(keyword) {
            Some(HeaderValue::Integer(value)) => Ok(*value),
            _ => Err(FitsError::MissingKeyword(keyword)),
        }
    }

    pub fn get_text(&self, keyword: &str) -> Option<&str> {
        match self.get(keyword) {
            Some(HeaderValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, FitsError> {
        let mut bytes = Vec::with_capacity(BLOCK_SIZE);
        for card in self.cards.iter() {
            bytes.extend_from_slice(card.render()?.as_bytes());
        }
        bytes.extend_from_slice(format!("{:<80}", "END").as_bytes());
        pad_block(&mut bytes, b' ');
        Ok(bytes)
    }

    /// Parse header cards up to END. Returns the header and its padded length in bytes.
    fn decode(bytes: &[u8]) -> Result<(Self, usize), FitsError> {
        let mut header = Self::new();
        for (idx, card) in bytes.chunks(CARD_SIZE).enumerate() {
            if card.len() < CARD_SIZE {
                break;
            }
            if !card.is_ascii() {
                continue;
            }
            let text = String::from_utf8_lossy(card);
            let keyword = text[..KEYWORD_SIZE].trim_end();
            if keyword == "END" {
                let used = (idx + 1) * CARD_SIZE;
                return Ok((header, used.div_ceil(BLOCK_SIZE) * BLOCK_SIZE));
            }
            if &text[KEYWORD_SIZE..KEYWORD_SIZE + 2] != "= " {
                continue;
            }
            if let Some(value) = HeaderValue::parse(&text[KEYWORD_SIZE + 2..]) {
                header.cards.push(Card {
                    keyword: keyword.to_string(),
                    value,
                    comment: None,
                });
            }
        }
        Err(FitsError::MissingKeyword("END"))
    }
}

fn pad_block(bytes: &mut Vec<u8>, fill: u8) {
    let remainder = bytes.len() % BLOCK_SIZE;
    if remainder != 0 {
        bytes.resize(bytes.len() + BLOCK_SIZE - remainder, fill);
    }
}

/// Encode `data` (rows = frames) as a FITS file, with `extra` cards after the mandatory ones
pub fn encode_image(data: ArrayView2<u8>, extra: &FitsHeader) -> Result<Vec<u8>, FitsError> {
    let (rows, columns) = data.dim();
    let mut header = FitsHeader::new();
    header.push("SIMPLE", HeaderValue::Logical(true), Some("conforms to FITS"))?;
    header.push("BITPIX", HeaderValue::Integer(8), Some("unsigned bytes"))?;
    header.push("NAXIS", HeaderValue::Integer(2), None)?;
    header.push("NAXIS1", HeaderValue::Integer(columns as i64), Some("bytes per frame"))?;
    header.push("NAXIS2", HeaderValue::Integer(rows as i64), Some("frames"))?;
    header.cards.extend(extra.cards.iter().cloned());

    let mut bytes = header.encode()?;
    bytes.extend(data.iter().copied());
    pad_block(&mut bytes, 0);
    Ok(bytes)
}

/// Decode a file written by `encode_image`
pub fn decode_image(bytes: &[u8]) -> Result<(FitsHeader, Array2<u8>), FitsError> {
    let (header, offset) = FitsHeader::decode(bytes)?;
    let bitpix = header.get_integer("BITPIX")?;
    if bitpix != 8 || header.get_integer("NAXIS")? != 2 {
        return Err(FitsError::UnsupportedBitpix(bitpix));
    }
    let columns = header.get_integer("NAXIS1")?.max(0) as usize;
    let rows = header.get_integer("NAXIS2")?.max(0) as usize;
    let expected = rows * columns;
    let data = bytes.get(offset..).unwrap_or_default();
    if data.len() < expected {
        return Err(FitsError::Truncated {
            expected,
            found: data.len(),
        });
    }
    let array = Array2::from_shape_vec((rows, columns), data[..expected].to_vec())?;
    Ok((header, array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_card_layout() {
        let card = Card {
            keyword: String::from("NAXIS1"),
            value: HeaderValue::Integer(512),
            comment: None,
        };
        let text = card.render().unwrap();
        assert_eq!(text.len(), 80);
        assert_eq!(&text[..10], "NAXIS1  = ");
        assert_eq!(&text[27..30], "512");

        let card = Card {
            keyword: String::from("FRAME1"),
            value: HeaderValue::Text(String::from("it's")),
            comment: Some(String::from("frame name")),
        };
        let text = card.render().unwrap();
        assert!(text.starts_with("FRAME1  = 'it''s   ' / frame name"));
    }

    #[test]
    fn test_encode_decode() {
        let data = array![[1u8, 2, 3], [4, 5, 6]];
        let mut extra = FitsHeader::new();
        extra
            .push("IMAGE", HeaderValue::Text(String::from("TopA")), None)
            .unwrap();
        let bytes = encode_image(data.view(), &extra).unwrap();
        assert_eq!(bytes.len() % BLOCK_SIZE, 0);
        assert!(bytes.starts_with(b"SIMPLE  =                    T"));

        let (header, decoded) = decode_image(&bytes).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(header.get_text("IMAGE"), Some("TopA"));
        assert_eq!(header.get_integer("NAXIS2").unwrap(), 2);
    }

    #[test]
    fn test_bad_keyword() {
        let mut header = FitsHeader::new();
        assert!(header
            .push("TOOLONGKEY", HeaderValue::Integer(1), None)
            .is_err());
        assert!(header.push("lower", HeaderValue::Integer(1), None).is_err());
    }

    #[test]
    fn test_truncated() {
        let data = Array2::from_elem((1, 4000), 1u8);
        let bytes = encode_image(data.view(), &FitsHeader::new()).unwrap();
        let result = decode_image(&bytes[..BLOCK_SIZE + 100]);
        assert!(matches!(result, Err(FitsError::Truncated { .. })));
    }
}
