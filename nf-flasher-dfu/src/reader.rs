//! Bounds checked little-endian cursor used by the container parser.

use crate::file::ParseError;

pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) const fn position(&self) -> usize {
        self.pos
    }

    pub(crate) const fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], ParseError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(ParseError::FormatInvalid {
                offset: self.pos,
                reason: what,
            })?;

        let temp = &self.data[self.pos..end];
        self.pos = end;
        Ok(temp)
    }

    pub(crate) fn array<const N: usize>(
        &mut self,
        what: &'static str,
    ) -> Result<[u8; N], ParseError> {
        let mut temp = [0u8; N];
        temp.copy_from_slice(self.take(N, what)?);
        Ok(temp)
    }

    pub(crate) fn u8(&mut self, what: &'static str) -> Result<u8, ParseError> {
        self.array::<1>(what).map(|x| x[0])
    }

    pub(crate) fn u16(&mut self, what: &'static str) -> Result<u16, ParseError> {
        self.array(what).map(u16::from_le_bytes)
    }

    pub(crate) fn u32(&mut self, what: &'static str) -> Result<u32, ParseError> {
        self.array(what).map(u32::from_le_bytes)
    }

    /// Check a fixed signature, reporting the offset where it should have been.
    pub(crate) fn expect(
        &mut self,
        signature: &[u8],
        what: &'static str,
    ) -> Result<(), ParseError> {
        let offset = self.pos;
        if self.take(signature.len(), what)? == signature {
            Ok(())
        } else {
            Err(ParseError::FormatInvalid {
                offset,
                reason: what,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ByteReader;
    use crate::file::ParseError;

    #[test]
    fn reads_little_endian() {
        let data = [0x01, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12];
        let mut r = ByteReader::new(&data);

        assert_eq!(r.u8("a").unwrap(), 1);
        assert_eq!(r.u16("b").unwrap(), 0x1234);
        assert_eq!(r.u32("c").unwrap(), 0x12345678);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn overrun_reports_offset() {
        let data = [0u8; 3];
        let mut r = ByteReader::new(&data);
        r.u16("first").unwrap();

        assert_eq!(
            r.u32("second"),
            Err(ParseError::FormatInvalid {
                offset: 2,
                reason: "second"
            })
        );
        // Failed reads do not move the cursor
        assert_eq!(r.position(), 2);
        assert!(r.take(usize::MAX, "huge").is_err());
    }
}
