//! Primitive notations of the wire format.
//!
//! All integers are big-endian. Strings are length-prefixed UTF-8; byte blobs
//! follow the same shape with a signed length where -1 means null and -2
//! means "not set". Every read is bounds-checked so a truncated body surfaces
//! as [`CodingError::UnexpectedEnd`] rather than a panic.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes};
use failure::Fail;

use crate::Uuid;

#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum CodingError {
    #[fail(display = "unexpected end of buffer")]
    UnexpectedEnd,
    #[fail(display = "malformed {}", _0)]
    Malformed(&'static str),
}

pub type Result<T> = ::std::result::Result<T, CodingError>;

pub trait Codec: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    fn encode<B: BufMut>(&self, buf: &mut B);
}

macro_rules! int_codec {
    ($ty:ty, $get:ident, $put:ident) => {
        impl Codec for $ty {
            fn decode<B: Buf>(buf: &mut B) -> Result<$ty> {
                if buf.remaining() < ::std::mem::size_of::<$ty>() {
                    return Err(CodingError::UnexpectedEnd);
                }
                Ok(buf.$get())
            }
            fn encode<B: BufMut>(&self, buf: &mut B) {
                buf.$put(*self);
            }
        }
    };
}

int_codec!(u8, get_u8, put_u8);
int_codec!(i8, get_i8, put_i8);
int_codec!(u16, get_u16, put_u16);
int_codec!(i16, get_i16, put_i16);
int_codec!(u32, get_u32, put_u32);
int_codec!(i32, get_i32, put_i32);
int_codec!(u64, get_u64, put_u64);
int_codec!(i64, get_i64, put_i64);

impl Codec for Uuid {
    fn decode<B: Buf>(buf: &mut B) -> Result<Uuid> {
        if buf.remaining() < 16 {
            return Err(CodingError::UnexpectedEnd);
        }
        let mut bytes = [0; 16];
        buf.copy_to_slice(&mut bytes);
        Ok(Uuid(bytes))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.0);
    }
}

pub trait BufExt {
    fn get<T: Codec>(&mut self) -> Result<T>;
    fn take_bytes(&mut self, len: usize) -> Result<Bytes>;
    /// [string]: u16 length + UTF-8 bytes.
    fn get_string(&mut self) -> Result<String>;
    /// [long string]: u32 length + UTF-8 bytes.
    fn get_long_string(&mut self) -> Result<String>;
    /// [bytes]: i32 length, negative meaning null.
    fn get_bytes(&mut self) -> Result<Option<Bytes>>;
    /// [short bytes]: u16 length + bytes.
    fn get_short_bytes(&mut self) -> Result<Bytes>;
    /// [inet]: 1-byte address length, address bytes, u32 port.
    fn get_inet(&mut self) -> Result<SocketAddr>;
    fn get_string_list(&mut self) -> Result<Vec<String>>;
    fn get_string_map(&mut self) -> Result<Vec<(String, String)>>;
    fn get_string_multimap(&mut self) -> Result<Vec<(String, Vec<String>)>>;
}

impl<B: Buf> BufExt for B {
    fn get<T: Codec>(&mut self) -> Result<T> {
        T::decode(self)
    }

    fn take_bytes(&mut self, len: usize) -> Result<Bytes> {
        if self.remaining() < len {
            return Err(CodingError::UnexpectedEnd);
        }
        Ok(self.copy_to_bytes(len))
    }

    fn get_string(&mut self) -> Result<String> {
        let len = self.get::<u16>()? as usize;
        let raw = self.take_bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodingError::Malformed("string"))
    }

    fn get_long_string(&mut self) -> Result<String> {
        let len = self.get::<u32>()? as usize;
        let raw = self.take_bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodingError::Malformed("long string"))
    }

    fn get_bytes(&mut self) -> Result<Option<Bytes>> {
        let len = self.get::<i32>()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(self.take_bytes(len as usize)?))
    }

    fn get_short_bytes(&mut self) -> Result<Bytes> {
        let len = self.get::<u16>()? as usize;
        self.take_bytes(len)
    }

    fn get_inet(&mut self) -> Result<SocketAddr> {
        let len = self.get::<u8>()?;
        let ip = match len {
            4 => {
                let mut octets = [0; 4];
                if self.remaining() < 4 {
                    return Err(CodingError::UnexpectedEnd);
                }
                self.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 => {
                let mut octets = [0; 16];
                if self.remaining() < 16 {
                    return Err(CodingError::UnexpectedEnd);
                }
                self.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(CodingError::Malformed("inet address length")),
        };
        let port = self.get::<u32>()?;
        if port > u32::from(u16::max_value()) {
            return Err(CodingError::Malformed("inet port"));
        }
        Ok(SocketAddr::new(ip, port as u16))
    }

    fn get_string_list(&mut self) -> Result<Vec<String>> {
        let n = self.get::<u16>()? as usize;
        let mut out = Vec::with_capacity(n.min(256));
        for _ in 0..n {
            out.push(self.get_string()?);
        }
        Ok(out)
    }

    fn get_string_map(&mut self) -> Result<Vec<(String, String)>> {
        let n = self.get::<u16>()? as usize;
        let mut out = Vec::with_capacity(n.min(256));
        for _ in 0..n {
            let k = self.get_string()?;
            let v = self.get_string()?;
            out.push((k, v));
        }
        Ok(out)
    }

    fn get_string_multimap(&mut self) -> Result<Vec<(String, Vec<String>)>> {
        let n = self.get::<u16>()? as usize;
        let mut out = Vec::with_capacity(n.min(256));
        for _ in 0..n {
            let k = self.get_string()?;
            let v = self.get_string_list()?;
            out.push((k, v));
        }
        Ok(out)
    }
}

pub trait BufMutExt {
    fn write<T: Codec>(&mut self, x: T);
    fn put_string(&mut self, s: &str);
    fn put_long_string(&mut self, s: &str);
    fn put_bytes_opt(&mut self, b: Option<&[u8]>);
    fn put_short_bytes(&mut self, b: &[u8]);
    fn put_inet(&mut self, addr: SocketAddr);
    fn put_string_list(&mut self, items: &[String]);
    fn put_string_map<'a, I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>;
}

impl<B: BufMut> BufMutExt for B {
    fn write<T: Codec>(&mut self, x: T) {
        x.encode(self);
    }

    fn put_string(&mut self, s: &str) {
        debug_assert!(s.len() <= u16::max_value() as usize);
        self.write::<u16>(s.len() as u16);
        self.put_slice(s.as_bytes());
    }

    fn put_long_string(&mut self, s: &str) {
        self.write::<u32>(s.len() as u32);
        self.put_slice(s.as_bytes());
    }

    fn put_bytes_opt(&mut self, b: Option<&[u8]>) {
        match b {
            Some(b) => {
                self.write::<i32>(b.len() as i32);
                self.put_slice(b);
            }
            None => self.write::<i32>(-1),
        }
    }

    fn put_short_bytes(&mut self, b: &[u8]) {
        debug_assert!(b.len() <= u16::max_value() as usize);
        self.write::<u16>(b.len() as u16);
        self.put_slice(b);
    }

    fn put_inet(&mut self, addr: SocketAddr) {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.write::<u8>(4);
                self.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                self.write::<u8>(16);
                self.put_slice(&ip.octets());
            }
        }
        self.write::<u32>(u32::from(addr.port()));
    }

    fn put_string_list(&mut self, items: &[String]) {
        self.write::<u16>(items.len() as u16);
        for item in items {
            self.put_string(item);
        }
    }

    fn put_string_map<'a, I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let entries = entries.into_iter().collect::<Vec<_>>();
        self.write::<u16>(entries.len() as u16);
        for (k, v) in entries {
            self.put_string(k);
            self.put_string(v);
        }
    }
}
