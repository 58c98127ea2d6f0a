//! Wire format of the host selection protocol.
//!
//! Every datagram starts with `state:u8 | req_id:10 | attempt_no:u32` (big
//! endian) and carries extra fields depending on the state and on the
//! protocol flavor.

use crate::domain::model::State;
use crate::utils::error::{FogError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const REQ_ID_LEN: usize = 10;
pub const MAC_LEN: usize = 17;
pub const IP_LEN: usize = 15;
const HEADER_LEN: usize = 1 + REQ_ID_LEN + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Broadcast,
    Orchestrator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub state: State,
    pub req_id: String,
    pub attempt_no: u32,
    pub cos_id: u32,
    pub data: Bytes,
    pub cpu_offer: f64,
    pub ram_offer: f64,
    pub disk_offer: f64,
    pub src_mac: String,
    pub src_ip: String,
    pub host_mac: String,
    pub host_ip: String,
}

impl Packet {
    pub fn new(state: State, req_id: impl Into<String>, attempt_no: u32) -> Self {
        Self {
            state,
            req_id: req_id.into(),
            attempt_no,
            cos_id: 1,
            data: Bytes::new(),
            cpu_offer: 0.0,
            ram_offer: 0.0,
            disk_offer: 0.0,
            src_mac: String::new(),
            src_ip: String::new(),
            host_mac: String::new(),
            host_ip: String::new(),
        }
    }

    pub fn with_cos(mut self, cos_id: u32) -> Self {
        self.cos_id = cos_id;
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_offer(mut self, cpu: f64, ram: f64, disk: f64) -> Self {
        self.cpu_offer = cpu;
        self.ram_offer = ram;
        self.disk_offer = disk;
        self
    }

    pub fn with_src(mut self, mac: impl Into<String>, ip: impl Into<String>) -> Self {
        self.src_mac = mac.into();
        self.src_ip = ip.into();
        self
    }

    pub fn with_host(mut self, mac: impl Into<String>, ip: impl Into<String>) -> Self {
        self.host_mac = mac.into();
        self.host_ip = ip.into();
        self
    }

    /// Same packet with another state (how replies are built).
    pub fn reply(&self, state: State) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// 判斷此封包是否為 `other` 的回應
    pub fn answers(&self, other: &Packet, flavor: Flavor) -> bool {
        if self.req_id != other.req_id {
            return false;
        }
        if flavor == Flavor::Orchestrator && self.attempt_no != other.attempt_no {
            return false;
        }
        use State::*;
        match other.state {
            Hreq => self.state == Hres,
            Rreq => matches!(self.state, Rres | Rcan),
            Rres => match flavor {
                Flavor::Broadcast => matches!(self.state, Dreq | Rcan),
                Flavor::Orchestrator => matches!(self.state, Rack | Rcan),
            },
            Dreq => matches!(self.state, Dres | Dwait | Dcan),
            Dres => matches!(self.state, Dack | Dcan),
            _ => false,
        }
    }

    pub fn encode(&self, flavor: Flavor) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.data.len() + 2 * (MAC_LEN + IP_LEN));
        buf.put_u8(self.state.into());
        put_fixed(&mut buf, &self.req_id, REQ_ID_LEN, 0);
        buf.put_u32(self.attempt_no);

        if has_cos(self.state, flavor) {
            buf.put_u32(self.cos_id);
        }
        if has_offer(self.state, flavor) {
            buf.put_f64(self.cpu_offer);
            buf.put_f64(self.ram_offer);
            buf.put_f64(self.disk_offer);
        }
        if has_src(self.state, flavor) {
            put_fixed(&mut buf, &self.src_mac, MAC_LEN, b' ');
            put_fixed(&mut buf, &self.src_ip, IP_LEN, b' ');
        }
        if has_host(self.state, flavor) {
            put_fixed(&mut buf, &self.host_mac, MAC_LEN, b' ');
            put_fixed(&mut buf, &self.host_ip, IP_LEN, b' ');
        }
        if has_data(self.state) {
            buf.put_slice(&self.data);
        }
        buf.freeze()
    }

    pub fn decode(raw: &[u8], flavor: Flavor) -> Result<Self> {
        let mut buf = raw;
        if buf.remaining() < HEADER_LEN {
            return Err(FogError::packet(format!(
                "{} bytes is shorter than the {}-byte header",
                raw.len(),
                HEADER_LEN
            )));
        }

        let state = State::try_from(buf.get_u8()).map_err(FogError::packet)?;
        let req_id = take_fixed(&mut buf, REQ_ID_LEN, "req_id")?;
        let attempt_no = buf.get_u32();
        let mut packet = Packet::new(state, req_id, attempt_no);

        if has_cos(state, flavor) {
            ensure(&buf, 4, "cos_id")?;
            packet.cos_id = buf.get_u32();
        }
        if has_offer(state, flavor) {
            ensure(&buf, 24, "offers")?;
            packet.cpu_offer = buf.get_f64();
            packet.ram_offer = buf.get_f64();
            packet.disk_offer = buf.get_f64();
        }
        if has_src(state, flavor) {
            packet.src_mac = take_fixed(&mut buf, MAC_LEN, "src_mac")?;
            packet.src_ip = take_fixed(&mut buf, IP_LEN, "src_ip")?;
        }
        if has_host(state, flavor) {
            packet.host_mac = take_fixed(&mut buf, MAC_LEN, "host_mac")?;
            packet.host_ip = take_fixed(&mut buf, IP_LEN, "host_ip")?;
        }
        // data 一律是最後一個欄位
        if has_data(state) {
            packet.data = Bytes::copy_from_slice(buf);
        }
        Ok(packet)
    }
}

fn has_cos(state: State, flavor: Flavor) -> bool {
    match flavor {
        Flavor::Broadcast => state == State::Hreq,
        Flavor::Orchestrator => matches!(state, State::Hreq | State::Rreq),
    }
}

fn has_data(state: State) -> bool {
    matches!(state, State::Dreq | State::Dres)
}

fn has_offer(state: State, flavor: Flavor) -> bool {
    flavor == Flavor::Broadcast && state == State::Hres
}

fn has_src(state: State, flavor: Flavor) -> bool {
    use State::*;
    flavor == Flavor::Orchestrator && matches!(state, Rreq | Rres | Rack | Rcan | Dack | Dcan)
}

fn has_host(state: State, flavor: Flavor) -> bool {
    use State::*;
    flavor == Flavor::Orchestrator && matches!(state, Hres | Dcan | Dack)
}

fn put_fixed(buf: &mut BytesMut, value: &str, len: usize, pad: u8) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(len);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(pad, len - n);
}

fn ensure(buf: &&[u8], len: usize, field: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(FogError::packet(format!("truncated {} field", field)));
    }
    Ok(())
}

fn take_fixed(buf: &mut &[u8], len: usize, field: &str) -> Result<String> {
    ensure(buf, len, field)?;
    let raw = &buf[..len];
    let value = std::str::from_utf8(raw)
        .map_err(|_| FogError::packet(format!("{} is not valid UTF-8", field)))?
        .trim_end_matches(['\0', ' '])
        .to_string();
    buf.advance(len);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let raw = Packet::new(State::Rres, "abcdefghij", 258).encode(Flavor::Broadcast);
        assert_eq!(raw.len(), HEADER_LEN);
        assert_eq!(raw[0], 4);
        assert_eq!(&raw[1..11], b"abcdefghij");
        assert_eq!(&raw[11..15], &[0, 0, 1, 2]);
    }

    #[test]
    fn test_broadcast_hres_carries_offers_only() {
        let pkt = Packet::new(State::Hres, "abcdefghij", 1)
            .with_offer(2.5, 1024.0, 10.0)
            .with_host("aa:bb:cc:dd:ee:ff", "10.0.0.2");
        let raw = pkt.encode(Flavor::Broadcast);
        assert_eq!(raw.len(), HEADER_LEN + 24);

        let decoded = Packet::decode(&raw, Flavor::Broadcast).unwrap();
        assert_eq!(decoded.cpu_offer, 2.5);
        assert_eq!(decoded.ram_offer, 1024.0);
        assert_eq!(decoded.disk_offer, 10.0);
        assert!(decoded.host_ip.is_empty());
    }

    #[test]
    fn test_orchestrator_fields_are_space_padded() {
        let pkt = Packet::new(State::Dack, "abcdefghij", 3)
            .with_src("00:00:00:00:00:01", "10.0.0.1")
            .with_host("00:00:00:00:00:02", "10.0.0.2");
        let raw = pkt.encode(Flavor::Orchestrator);
        assert_eq!(raw.len(), HEADER_LEN + 2 * (MAC_LEN + IP_LEN));
        assert_eq!(&raw[HEADER_LEN + MAC_LEN..HEADER_LEN + MAC_LEN + IP_LEN], b"10.0.0.1       ");

        let decoded = Packet::decode(&raw, Flavor::Orchestrator).unwrap();
        assert_eq!(decoded.src_ip, "10.0.0.1");
        assert_eq!(decoded.host_mac, "00:00:00:00:00:02");
        assert_eq!(decoded.host_ip, "10.0.0.2");
    }

    #[test]
    fn test_data_takes_the_rest_of_the_datagram() {
        let pkt = Packet::new(State::Dreq, "abcdefghij", 1).with_data(&b"data + program"[..]);
        let decoded = Packet::decode(&pkt.encode(Flavor::Orchestrator), Flavor::Orchestrator).unwrap();
        assert_eq!(&decoded.data[..], b"data + program");
    }

    #[test]
    fn test_cos_id_presence_depends_on_flavor() {
        let rreq = Packet::new(State::Rreq, "abcdefghij", 1).with_cos(4);
        assert_eq!(rreq.encode(Flavor::Broadcast).len(), HEADER_LEN);

        let decoded = Packet::decode(&rreq.encode(Flavor::Orchestrator), Flavor::Orchestrator).unwrap();
        assert_eq!(decoded.cos_id, 4);
    }

    #[test]
    fn test_decode_rejects_truncated_and_unknown() {
        assert!(Packet::decode(&[1, 2, 3], Flavor::Broadcast).is_err());

        let mut raw = Packet::new(State::Hreq, "abcdefghij", 1).encode(Flavor::Broadcast).to_vec();
        raw.truncate(HEADER_LEN + 2);
        assert!(Packet::decode(&raw, Flavor::Broadcast).is_err());

        raw[0] = 42;
        assert!(Packet::decode(&raw, Flavor::Broadcast).is_err());
    }

    #[test]
    fn test_answer_matching() {
        let hreq = Packet::new(State::Hreq, "abcdefghij", 1);
        assert!(hreq.reply(State::Hres).answers(&hreq, Flavor::Broadcast));
        assert!(!hreq.reply(State::Rres).answers(&hreq, Flavor::Broadcast));

        let rres = Packet::new(State::Rres, "abcdefghij", 1);
        assert!(rres.reply(State::Dreq).answers(&rres, Flavor::Broadcast));
        assert!(!rres.reply(State::Dreq).answers(&rres, Flavor::Orchestrator));
        assert!(rres.reply(State::Rack).answers(&rres, Flavor::Orchestrator));

        let dreq = Packet::new(State::Dreq, "abcdefghij", 1);
        let mut dres = dreq.reply(State::Dres);
        dres.attempt_no = 2;
        assert!(dres.answers(&dreq, Flavor::Broadcast));
        assert!(!dres.answers(&dreq, Flavor::Orchestrator));

        let other = Packet::new(State::Dres, "zzzzzzzzzz", 1);
        assert!(!other.answers(&dreq, Flavor::Broadcast));
    }
}
