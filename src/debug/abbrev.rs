//! The abbreviation table. Every DIE starts with a code that indexes into
//! this table; the table entry names the DIE's tag and the name and form of
//! each of its attribute values.
use super::{decode_i64, decode_u64, AttributeName, Form, Tag};
use crate::elf::Stream;
use crate::error::{Error, Result};

pub struct Abbreviation {
    /// DW_TAG_compile_unit, DW_TAG_subprogram, etc.
    pub tag: Tag,
    pub has_children: bool,
    pub attrs: Vec<AttrSpec>,
}

pub struct AttrSpec {
    pub name: AttributeName,
    pub form: Form,

    /// Only for DW_FORM_implicit_const: the value lives in the abbreviation
    /// itself rather than in the DIE.
    pub value: Option<i64>,
}

impl Abbreviation {
    /// Read the next abbreviation declaration, returning its 1-based code.
    /// A code of zero terminates the table and yields `None`.
    pub fn new(stream: &mut Stream) -> Result<Option<(u64, Abbreviation)>> {
        let code = decode_u64(stream)?;
        if code == 0 {
            return Ok(None);
        }

        let tag = Tag::from_u64(decode_u64(stream)?);
        let has_children = stream.read_byte()? != 0;

        let mut attrs = Vec::new();
        loop {
            let name = decode_u64(stream)?;
            let form = decode_u64(stream)?;
            if name == 0 && form == 0 {
                break;
            }
            if name == 0 || form == 0 {
                return Err(Error::BadDwarf(format!(
                    "unpaired terminator in abbreviation {code}"
                )));
            }
            let form = Form::from_u64(form)?;
            let value =
                if form == Form::DW_FORM_implicit_const { Some(decode_i64(stream)?) } else { None };
            attrs.push(AttrSpec { name: AttributeName::from_u64(name), form, value });
        }
        Ok(Some((code, Abbreviation { tag, has_children, attrs })))
    }

    pub fn find_attr(&self, name: AttributeName) -> Option<(usize, &AttrSpec)> {
        self.attrs.iter().enumerate().find(|(_, a)| a.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{Layout, MemReader, Stream};

    const LE64: Layout = Layout { little_endian: true, sixty_four_bit: true };

    #[test]
    fn parses_until_terminator() {
        // code 1: compile_unit, has children, name=string, stmt_list=sec_offset
        // code 2: subprogram, no children, low_pc=addr
        let bytes = vec![
            1, 0x11, 1, 0x03, 0x08, 0x10, 0x17, 0, 0, //
            2, 0x2e, 0, 0x11, 0x01, 0, 0, //
            0,
        ];
        let r = MemReader::new("abbrev", bytes);
        let mut s = Stream::new(&r, LE64, 0);

        let (code, abbrev) = Abbreviation::new(&mut s).unwrap().unwrap();
        assert_eq!(code, 1);
        assert_eq!(abbrev.tag, Tag::DW_TAG_compile_unit);
        assert!(abbrev.has_children);
        assert_eq!(abbrev.attrs.len(), 2);
        assert!(abbrev.find_attr(AttributeName::DW_AT_stmt_list).is_some());

        let (code, abbrev) = Abbreviation::new(&mut s).unwrap().unwrap();
        assert_eq!(code, 2);
        assert_eq!(abbrev.tag, Tag::DW_TAG_subprogram);
        assert!(!abbrev.has_children);

        assert!(Abbreviation::new(&mut s).unwrap().is_none());
    }
}
