//! Wire framing for the operation surface: length-delimited frames
//! (`tokio_util::codec`) carrying `bincode`-encoded `flagdb::ops::{Request,
//! Reply}` values.

use bytes::Bytes;
use flagdb::ops::{Reply, Request};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub type Transport = Framed<TcpStream, LengthDelimitedCodec>;

pub fn transport(stream: TcpStream) -> Transport {
    Framed::new(stream, LengthDelimitedCodec::new())
}

pub fn encode_request(request: &Request) -> anyhow::Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(request)?))
}

pub fn decode_request(frame: &[u8]) -> anyhow::Result<Request> {
    Ok(bincode::deserialize(frame)?)
}

pub fn encode_reply(reply: &Reply) -> anyhow::Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(reply)?))
}

pub fn decode_reply(frame: &[u8]) -> anyhow::Result<Reply> {
    Ok(bincode::deserialize(frame)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use flagdb::ops::FlagArgs;

    #[test]
    fn request_roundtrips_through_bincode() {
        let req = Request::OpenFlag(FlagArgs { chain: 1, flag: b"flag1".to_vec() });
        let encoded = encode_request(&req).unwrap();
        let decoded = decode_request(&encoded).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn reply_roundtrips_through_bincode() {
        let reply = Reply::Bytes(b"value1".to_vec());
        let encoded = encode_reply(&reply).unwrap();
        let decoded = decode_reply(&encoded).unwrap();
        assert_eq!(reply, decoded);
    }
}
