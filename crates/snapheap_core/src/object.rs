//! Live object model of the host runtime.
//!
//! These are the ordinary heap values a program works with. The archive only
//! reads them (move-in) or rebuilds them (`Archived::to_object`).

use crate::runtime::Sentinel;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Write as _};

/// Arbitrary-precision integer, sign + magnitude in 30-bit digits (least significant first).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Int {
    negative: bool,
    digits: Vec<u32>,
}

impl Int {
    pub const SHIFT: u32 = 30;
    pub const MASK: u32 = (1 << Self::SHIFT) - 1;

    /// Build from raw parts; trailing zero digits are dropped and zero is never negative.
    pub fn from_parts(negative: bool, mut digits: Vec<u32>) -> Self {
        while digits.last() == Some(&0) {
            digits.pop();
        }
        let negative = negative && !digits.is_empty();
        Self { negative, digits }
    }

    pub fn digits(&self) -> &[u32] { &self.digits }
    pub fn is_negative(&self) -> bool { self.negative }
    pub fn is_zero(&self) -> bool { self.digits.is_empty() }

    /// Digit count carrying the sign of the number.
    pub fn signed_size(&self) -> i64 {
        let n = self.digits.len() as i64;
        if self.negative { -n } else { n }
    }

    pub fn to_i64(&self) -> Option<i64> {
        if self.digits.len() > 3 { return None; }
        let mut mag: u128 = 0;
        for d in self.digits.iter().rev() {
            mag = (mag << Self::SHIFT) | *d as u128;
        }
        if self.negative {
            if mag <= i64::MAX as u128 + 1 { Some((mag as i128).wrapping_neg() as i64) } else { None }
        } else {
            i64::try_from(mag).ok()
        }
    }

    /// Parse an optionally signed decimal literal.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (negative, body) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };
        if body.is_empty() {
            return Err(format!("invalid integer literal {s:?}"));
        }
        let mut digits: Vec<u32> = Vec::new();
        for c in body.chars() {
            let d = c.to_digit(10).ok_or_else(|| format!("invalid integer literal {s:?}"))?;
            let mut carry = d as u64;
            for x in digits.iter_mut() {
                let cur = *x as u64 * 10 + carry;
                *x = (cur & Self::MASK as u64) as u32;
                carry = cur >> Self::SHIFT;
            }
            if carry > 0 {
                digits.push(carry as u32);
            }
        }
        Ok(Self::from_parts(negative, digits))
    }
}

impl From<i64> for Int {
    fn from(v: i64) -> Self {
        let mut mag = v.unsigned_abs();
        let mut digits = Vec::new();
        while mag > 0 {
            digits.push((mag & Self::MASK as u64) as u32);
            mag >>= Self::SHIFT;
        }
        Self::from_parts(v < 0, digits)
    }
}

impl fmt::Display for Int {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("0");
        }
        const CHUNK: u64 = 1_000_000_000;
        let mut mag = self.digits.clone();
        let mut chunks = Vec::new();
        while !mag.is_empty() {
            let mut rem = 0u64;
            for d in mag.iter_mut().rev() {
                let cur = (rem << Self::SHIFT) | *d as u64;
                *d = (cur / CHUNK) as u32;
                rem = cur % CHUNK;
            }
            chunks.push(rem as u32);
            while mag.last() == Some(&0) {
                mag.pop();
            }
        }
        if self.negative {
            f.write_str("-")?;
        }
        let mut it = chunks.iter().rev();
        if let Some(first) = it.next() {
            write!(f, "{first}")?;
        }
        for c in it {
            write!(f, "{c:09}")?;
        }
        Ok(())
    }
}

impl Serialize for Int {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self.to_i64() {
            Some(v) => s.serialize_i64(v),
            None => s.serialize_str(&self.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Int {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct IntVisitor;
        impl<'de> de::Visitor<'de> for IntVisitor {
            type Value = Int;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer or a decimal string")
            }
            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Int, E> { Ok(Int::from(v)) }
            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Int, E> {
                Int::parse(&v.to_string()).map_err(E::custom)
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<Int, E> { Int::parse(v).map_err(E::custom) }
        }
        d.deserialize_any(IntVisitor)
    }
}

/// A compiled unit of bytecode with its constant pool and debug tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeUnit {
    pub argcount: i32,
    pub posonlyargcount: i32,
    pub kwonlyargcount: i32,
    pub stacksize: i32,
    pub flags: i32,
    pub firstlineno: i32,
    pub nlocalsplus: i32,
    pub nlocals: i32,
    pub nplaincellvars: i32,
    pub ncellvars: i32,
    pub nfreevars: i32,
    pub warmup: i32,

    pub consts: Object,
    pub names: Object,
    pub code: Object,
    pub exceptiontable: Object,
    pub localsplusnames: Object,
    pub localspluskinds: Object,
    pub filename: Object,
    pub name: Object,
    pub qualname: Object,
    pub linetable: Object,
    pub endlinetable: Object,
    pub columntable: Object,
    pub varnames: Object,
    pub freevars: Object,
    pub cellvars: Object,
}

impl Default for CodeUnit {
    fn default() -> Self {
        let empty_tuple = Object::Tuple(Vec::new());
        let empty_bytes = Object::Bytes(Vec::new());
        Self {
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            stacksize: 0,
            flags: 0,
            firstlineno: 1,
            nlocalsplus: 0,
            nlocals: 0,
            nplaincellvars: 0,
            ncellvars: 0,
            nfreevars: 0,
            warmup: 0,
            consts: empty_tuple.clone(),
            names: empty_tuple.clone(),
            code: empty_bytes.clone(),
            exceptiontable: empty_bytes.clone(),
            localsplusnames: empty_tuple.clone(),
            localspluskinds: empty_bytes.clone(),
            filename: Object::Str(String::new()),
            name: Object::Str(String::new()),
            qualname: Object::Str(String::new()),
            linetable: empty_bytes.clone(),
            endlinetable: empty_bytes.clone(),
            columntable: empty_bytes,
            varnames: empty_tuple.clone(),
            freevars: empty_tuple.clone(),
            cellvars: empty_tuple,
        }
    }
}

impl CodeUnit {
    pub fn new(name: &str, filename: &str) -> Self {
        Self {
            name: Object::Str(name.to_string()),
            qualname: Object::Str(name.to_string()),
            filename: Object::Str(filename.to_string()),
            ..Self::default()
        }
    }
}

/// A live value. `List` and `Dict` exist in the runtime but cannot be archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Object {
    Absent,
    Bool(bool),
    Ellipsis,
    Int(Int),
    Float(f64),
    Complex { real: f64, imag: f64 },
    Bytes(Vec<u8>),
    Str(String),
    Tuple(Vec<Object>),
    FrozenSet(Vec<Object>),
    Code(Box<CodeUnit>),
    List(Vec<Object>),
    Dict(Vec<(Object, Object)>),
}

impl Object {
    pub fn int(v: i64) -> Self { Object::Int(Int::from(v)) }
    pub fn str(s: &str) -> Self { Object::Str(s.to_string()) }
    pub fn tuple(items: Vec<Object>) -> Self { Object::Tuple(items) }

    pub fn from_sentinel(s: Sentinel) -> Self {
        match s {
            Sentinel::Absent => Object::Absent,
            Sentinel::True => Object::Bool(true),
            Sentinel::False => Object::Bool(false),
            Sentinel::Ellipsis => Object::Ellipsis,
        }
    }

    pub fn sentinel(&self) -> Option<Sentinel> {
        match self {
            Object::Absent => Some(Sentinel::Absent),
            Object::Bool(true) => Some(Sentinel::True),
            Object::Bool(false) => Some(Sentinel::False),
            Object::Ellipsis => Some(Sentinel::Ellipsis),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Absent => "NoneType",
            Object::Bool(_) => "bool",
            Object::Ellipsis => "ellipsis",
            Object::Int(_) => "int",
            Object::Float(_) => "float",
            Object::Complex { .. } => "complex",
            Object::Bytes(_) => "bytes",
            Object::Str(_) => "str",
            Object::Tuple(_) => "tuple",
            Object::FrozenSet(_) => "frozenset",
            Object::Code(_) => "code",
            Object::List(_) => "list",
            Object::Dict(_) => "dict",
        }
    }

    pub fn repr(&self) -> String { self.to_string() }
}

fn fmt_float(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else {
        format!("{v:?}")
    }
}

// complex parts drop a trailing ".0"
fn fmt_complex_part(v: f64) -> String {
    let s = fmt_float(v);
    s.strip_suffix(".0").map(str::to_string).unwrap_or(s)
}

fn fmt_bytes(b: &[u8], out: &mut String) {
    out.push_str("b'");
    for &c in b {
        match c {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\t' => out.push_str("\\t"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7e => out.push(c as char),
            _ => { let _ = write!(out, "\\x{c:02x}"); }
        }
    }
    out.push('\'');
}

fn fmt_str(s: &str, out: &mut String) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => { let _ = write!(out, "\\x{:02x}", c as u32); }
            c => out.push(c),
        }
    }
    out.push('\'');
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Absent => f.write_str("None"),
            Object::Bool(true) => f.write_str("True"),
            Object::Bool(false) => f.write_str("False"),
            Object::Ellipsis => f.write_str("Ellipsis"),
            Object::Int(i) => write!(f, "{i}"),
            Object::Float(v) => f.write_str(&fmt_float(*v)),
            Object::Complex { real, imag } => {
                let im = fmt_complex_part(*imag);
                if *real == 0.0 && real.is_sign_positive() {
                    write!(f, "{im}j")
                } else {
                    let sign = if im.starts_with('-') { "" } else { "+" };
                    write!(f, "({}{sign}{im}j)", fmt_complex_part(*real))
                }
            }
            Object::Bytes(b) => {
                let mut s = String::new();
                fmt_bytes(b, &mut s);
                f.write_str(&s)
            }
            Object::Str(s) => {
                let mut out = String::new();
                fmt_str(s, &mut out);
                f.write_str(&out)
            }
            Object::Tuple(items) => {
                f.write_str("(")?;
                for (i, it) in items.iter().enumerate() {
                    if i > 0 { f.write_str(", ")?; }
                    write!(f, "{it}")?;
                }
                if items.len() == 1 { f.write_str(",")?; }
                f.write_str(")")
            }
            Object::FrozenSet(items) => {
                if items.is_empty() {
                    return f.write_str("frozenset()");
                }
                f.write_str("frozenset({")?;
                for (i, it) in items.iter().enumerate() {
                    if i > 0 { f.write_str(", ")?; }
                    write!(f, "{it}")?;
                }
                f.write_str("})")
            }
            Object::List(items) => {
                f.write_str("[")?;
                for (i, it) in items.iter().enumerate() {
                    if i > 0 { f.write_str(", ")?; }
                    write!(f, "{it}")?;
                }
                f.write_str("]")
            }
            Object::Dict(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 { f.write_str(", ")?; }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Object::Code(code) => {
                let name = match &code.name { Object::Str(s) => s.as_str(), _ => "?" };
                let file = match &code.filename { Object::Str(s) => s.as_str(), _ => "?" };
                write!(f, "<code object {name}, file \"{file}\", line {}>", code.firstlineno)
            }
        }
    }
}
