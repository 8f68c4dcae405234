use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_socket_addr(buf: &mut impl BufMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(data) => {
            buf.put_u8(4);
            buf.put_u32(data.ip().to_bits());
            buf.put_u16(data.port());
        }
        SocketAddr::V6(data) => {
            buf.put_u8(6);
            buf.put_u128(data.ip().to_bits());
            buf.put_u16(data.port());
        }
    }
}

pub fn try_get_socket_addr(buf: &mut impl Buf) -> anyhow::Result<SocketAddr> {
    let addr = match buf.try_get_u8()? {
        4 => {
            let ip = buf.try_get_u32()?;
            let port = buf.try_get_u16()?;
            SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
        }
        6 => {
            let ip = buf.try_get_u128()?;
            let port = buf.try_get_u16()?;
            SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0))
        }
        n => {
            return Err(anyhow!("invalid socket address discriminator: {}", n));
        }
    };
    Ok(addr)
}

pub fn put_u32_varint(buf: &mut impl BufMut, value: u32) {
    buf.put_u32_varint(value);
}

pub fn try_get_u32_varint(buf: &mut impl Buf) -> anyhow::Result<u32> {
    buf.try_get_u32_varint()
        .map_err(|e| anyhow!("invalid varint: {:?}", e))
}
