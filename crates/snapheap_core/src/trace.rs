//! Optional diagnostic sink: one text line per object observed during move-in.

use crate::codec::{FieldAccess, CODE_FIELDS};
use crate::errors::Result;
use crate::object::Object;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const MAX_REPR: usize = 80;

pub struct TraceSink {
    out: Box<dyn Write>,
    lines: u64,
}

impl TraceSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let f = File::create(path)?;
        Ok(Self::from_writer(BufWriter::new(f)))
    }

    pub fn from_writer(w: impl Write + 'static) -> Self {
        Self { out: Box::new(w), lines: 0 }
    }

    pub fn record(&mut self, obj: &Object) -> Result<()> {
        let mut repr = obj.repr();
        if repr.len() > MAX_REPR {
            let cut = (0..=MAX_REPR).rev().find(|i| repr.is_char_boundary(*i)).unwrap_or(0);
            repr.truncate(cut);
            repr.push_str("...");
        }
        writeln!(self.out, "{} {}", obj.type_name(), repr)?;
        self.lines += 1;
        Ok(())
    }

    /// Record `obj` and everything it references, in move-in order, without
    /// building an archive.
    pub fn record_graph(&mut self, obj: &Object) -> Result<()> {
        self.record(obj)?;
        match obj {
            Object::Tuple(items) | Object::FrozenSet(items) => {
                for item in items {
                    self.record_graph(item)?;
                }
            }
            Object::Code(code) => {
                for field in CODE_FIELDS.iter() {
                    if let FieldAccess::Ref { get, .. } = &field.access {
                        self.record_graph(get(code))?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn lines(&self) -> u64 { self.lines }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}
