//! Modbus/TCP bus client.
//!
//! Minimal MBAP framing for function 0x03 (read holding registers), which
//! is the only primitive the engine consumes. The stream reconnects lazily:
//! after an I/O or framing failure the connection is dropped and the next
//! read attempts a fresh connect, so a device outage never wedges the
//! client.
//!
//! Reads must stay correct under cancellation: the poller bounds every read
//! with a timeout, and a timeout fired mid-exchange drops this future after
//! the request was written but before the response arrived. The stream is
//! therefore taken out of its slot for the duration of an exchange and only
//! put back once the response frame is fully consumed — a cancelled or
//! failed exchange drops the connection with it, and the late response can
//! never be misread as the answer to the next request.

use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bus::BusClient;
use crate::error::TransportError;

const PROTOCOL_ID: u16 = 0;
const FC_READ_HOLDING: u8 = 0x03;
const EXCEPTION_FLAG: u8 = 0x80;
const MBAP_HEADER_LEN: usize = 7;
/// Function 0x03 allows at most 125 registers per request.
const MAX_READ_COUNT: u16 = 125;

pub struct ModbusTcpClient {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
    transaction_id: AtomicU16,
}

impl ModbusTcpClient {
    /// Connect to a Modbus/TCP endpoint (or a serial gateway fronting an
    /// RTU bus).
    pub async fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let addr = format!("{host}:{port}");
        let stream = Self::dial(&addr).await?;
        debug!(%addr, "modbus tcp connected");
        Ok(Self {
            addr,
            stream: Mutex::new(Some(stream)),
            transaction_id: AtomicU16::new(1),
        })
    }

    async fn dial(addr: &str) -> Result<TcpStream, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connection(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Take the stream out of its slot, reconnecting if the previous
    /// exchange left none behind.
    async fn checkout_stream(
        &self,
        guard: &mut Option<TcpStream>,
    ) -> Result<TcpStream, TransportError> {
        match guard.take() {
            Some(stream) => Ok(stream),
            None => {
                let stream = Self::dial(&self.addr).await?;
                debug!(addr = %self.addr, "modbus tcp reconnected");
                Ok(stream)
            }
        }
    }

    fn encode_request(&self, unit_id: u8, address: u16, count: u16) -> (u16, BytesMut) {
        let txn = self.transaction_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = BytesMut::with_capacity(12);
        frame.put_u16(txn);
        frame.put_u16(PROTOCOL_ID);
        frame.put_u16(6); // unit id + PDU
        frame.put_u8(unit_id);
        frame.put_u8(FC_READ_HOLDING);
        frame.put_u16(address);
        frame.put_u16(count);
        (txn, frame)
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        txn: u16,
        unit_id: u8,
        request: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        stream.write_all(request).await?;

        let mut header = [0u8; MBAP_HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let mut hdr = &header[..];
        let resp_txn = hdr.get_u16();
        let resp_proto = hdr.get_u16();
        let length = hdr.get_u16();
        let resp_unit = hdr.get_u8();

        if resp_proto != PROTOCOL_ID {
            return Err(TransportError::MalformedFrame(format!(
                "unexpected protocol id {resp_proto}"
            )));
        }
        if resp_txn != txn {
            return Err(TransportError::MalformedFrame(format!(
                "transaction id mismatch: sent {txn}, got {resp_txn}"
            )));
        }
        if resp_unit != unit_id {
            return Err(TransportError::MalformedFrame(format!(
                "unit id mismatch: sent {unit_id}, got {resp_unit}"
            )));
        }
        if length < 2 || length > 256 {
            return Err(TransportError::MalformedFrame(format!(
                "invalid MBAP length {length}"
            )));
        }

        // length counts the unit id byte already consumed
        let mut pdu = vec![0u8; length as usize - 1];
        stream.read_exact(&mut pdu).await?;
        Ok(pdu)
    }

    fn decode_response(
        unit_id: u8,
        count: u16,
        pdu: &[u8],
    ) -> Result<Vec<u16>, TransportError> {
        let fc = *pdu
            .first()
            .ok_or_else(|| TransportError::MalformedFrame("empty PDU".into()))?;

        if fc == FC_READ_HOLDING | EXCEPTION_FLAG {
            let code = pdu.get(1).copied().unwrap_or(0);
            return Err(TransportError::Exception { unit_id, code });
        }
        if fc != FC_READ_HOLDING {
            return Err(TransportError::MalformedFrame(format!(
                "unexpected function code {fc:#04x}"
            )));
        }

        let byte_count = *pdu
            .get(1)
            .ok_or_else(|| TransportError::MalformedFrame("missing byte count".into()))?
            as usize;
        let payload = &pdu[2..];
        if payload.len() < byte_count || byte_count % 2 != 0 {
            return Err(TransportError::MalformedFrame(format!(
                "byte count {byte_count} does not match payload of {} bytes",
                payload.len()
            )));
        }

        let words: Vec<u16> = payload[..byte_count]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        if words.len() != count as usize {
            if words.len() < count as usize {
                return Err(TransportError::ShortResponse {
                    requested: count,
                    received: words.len(),
                });
            }
            return Err(TransportError::MalformedFrame(format!(
                "response carries {} registers, requested {count}",
                words.len()
            )));
        }
        Ok(words)
    }
}

#[async_trait]
impl BusClient for ModbusTcpClient {
    async fn read_registers(
        &self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if count == 0 || count > MAX_READ_COUNT {
            return Err(TransportError::MalformedFrame(format!(
                "register count {count} outside 1-{MAX_READ_COUNT}"
            )));
        }

        let mut guard = self.stream.lock().await;
        let mut stream = self.checkout_stream(&mut guard).await?;

        let (txn, request) = self.encode_request(unit_id, address, count);
        match self.exchange(&mut stream, txn, unit_id, &request).await {
            Ok(pdu) => {
                // The response frame is fully consumed, so the connection is
                // at a frame boundary and reusable even when the PDU turns
                // out to be an exception or a bad register count.
                *guard = Some(stream);
                Self::decode_response(unit_id, count, &pdu)
            }
            Err(e) => {
                // Framing or I/O failure mid-frame: drop the connection so
                // the next read starts clean.
                warn!(addr = %self.addr, unit_id, error = %e, "modbus tcp read failed, resetting connection");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn decode_normal_response() {
        // FC 0x03, 4 bytes, registers [0x0102, 0x0304]
        let pdu = [0x03, 0x04, 0x01, 0x02, 0x03, 0x04];
        let words = ModbusTcpClient::decode_response(1, 2, &pdu).unwrap();
        assert_eq!(words, vec![0x0102, 0x0304]);
    }

    #[test]
    fn decode_exception_response() {
        // FC 0x83, exception code 0x02 (illegal data address)
        let pdu = [0x83, 0x02];
        let err = ModbusTcpClient::decode_response(5, 1, &pdu).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Exception {
                unit_id: 5,
                code: 0x02
            }
        ));
    }

    #[test]
    fn decode_short_response() {
        // 2 registers requested, 1 returned
        let pdu = [0x03, 0x02, 0x00, 0x07];
        let err = ModbusTcpClient::decode_response(1, 2, &pdu).unwrap_err();
        assert!(matches!(
            err,
            TransportError::ShortResponse {
                requested: 2,
                received: 1
            }
        ));
    }

    #[test]
    fn decode_overlong_response() {
        // 1 register requested, 2 returned: malformed, not silently trimmed
        let pdu = [0x03, 0x04, 0x00, 0x07, 0x00, 0x08];
        let err = ModbusTcpClient::decode_response(1, 1, &pdu).unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame(_)));
    }

    #[test]
    fn decode_malformed_responses() {
        assert!(ModbusTcpClient::decode_response(1, 1, &[]).is_err());
        // wrong function code
        assert!(ModbusTcpClient::decode_response(1, 1, &[0x04, 0x02, 0, 1]).is_err());
        // byte count exceeds payload
        assert!(ModbusTcpClient::decode_response(1, 1, &[0x03, 0x04, 0, 1]).is_err());
        // odd byte count
        assert!(ModbusTcpClient::decode_response(1, 1, &[0x03, 0x03, 0, 1, 2]).is_err());
    }

    /// In-process Modbus/TCP server answering function 0x03 with register
    /// values equal to their addresses. Accepts reconnects; the first
    /// request overall is optionally delayed before the response is sent.
    async fn run_server(listener: TcpListener, delay_first: Option<Duration>) {
        let mut delay = delay_first;
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            loop {
                let mut req = [0u8; 12];
                if socket.read_exact(&mut req).await.is_err() {
                    break;
                }
                if let Some(d) = delay.take() {
                    tokio::time::sleep(d).await;
                }
                let txn = u16::from_be_bytes([req[0], req[1]]);
                let unit = req[6];
                let address = u16::from_be_bytes([req[8], req[9]]);
                let count = u16::from_be_bytes([req[10], req[11]]);

                let mut resp = BytesMut::new();
                resp.put_u16(txn);
                resp.put_u16(PROTOCOL_ID);
                resp.put_u16(3 + 2 * count);
                resp.put_u8(unit);
                resp.put_u8(FC_READ_HOLDING);
                resp.put_u8((2 * count) as u8);
                for i in 0..count {
                    resp.put_u16(address + i);
                }
                if socket.write_all(&resp).await.is_err() {
                    break;
                }
            }
        }
    }

    async fn spawn_server(delay_first: Option<Duration>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(run_server(listener, delay_first));
        port
    }

    #[tokio::test]
    async fn reads_registers_over_live_socket() {
        let port = spawn_server(None).await;
        let client = ModbusTcpClient::connect("127.0.0.1", port).await.unwrap();

        let words = client.read_registers(1, 100, 3).await.unwrap();
        assert_eq!(words, vec![100, 101, 102]);

        // back-to-back reads reuse the connection
        let words = client.read_registers(1, 200, 1).await.unwrap();
        assert_eq!(words, vec![200]);
    }

    #[tokio::test]
    async fn timed_out_read_does_not_poison_next_read() {
        // the first response arrives late, well past the read timeout
        let port = spawn_server(Some(Duration::from_millis(300))).await;
        let client = ModbusTcpClient::connect("127.0.0.1", port).await.unwrap();

        // bounded the way the poller bounds every read
        let first = tokio::time::timeout(
            Duration::from_millis(100),
            client.read_registers(1, 10, 2),
        )
        .await;
        assert!(first.is_err(), "first read should time out");

        // the late response belongs to a dropped connection; the follow-up
        // read against the now-healthy device must decode its own answer
        let words = client.read_registers(1, 20, 2).await.unwrap();
        assert_eq!(words, vec![20, 21]);
    }
}
