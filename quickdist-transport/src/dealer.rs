use std::io::BufReader;
use std::net::TcpStream;
use std::sync::Mutex;

use quickdist_proto::Message;
use uuid::Uuid;

use crate::framing::{recv_frame, send_frame};
use crate::TransportError;

/// A client connection to a single [`crate::ReplyServer`]. Each call is a
/// strict send-then-receive exchange over one TCP connection; there is no
/// pipelining. `identity` has no effect on the wire (a TCP connection
/// already pins each dealer to the reply it gets back) but is kept around
/// for the same reason the router/dealer socket pair this was grounded on
/// carries one: so a node's logs can name which client it's talking to.
pub struct Dealer {
    identity: Uuid,
    stream: Mutex<BufReader<TcpStream>>,
}

impl Dealer {
    pub fn connect(addr: &str) -> Result<Dealer, TransportError> {
        let stream = TcpStream::connect(addr).map_err(|e| TransportError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;
        stream.set_nodelay(true).ok();
        Ok(Dealer {
            identity: Uuid::new_v4(),
            stream: Mutex::new(BufReader::new(stream)),
        })
    }

    pub fn identity(&self) -> Uuid {
        self.identity
    }

    /// Sends `request` and blocks for the matching reply.
    pub fn call(&self, request: &Message) -> Result<Message, TransportError> {
        let mut guard = self.stream.lock().expect("dealer stream mutex poisoned");
        let payload = request.encode().map_err(TransportError::Proto)?;
        {
            let stream = guard.get_mut();
            send_frame(stream, &payload)?;
        }
        let frame = recv_frame(&mut *guard)?.ok_or(TransportError::ConnectionClosed)?;
        Message::decode(&frame).map_err(TransportError::Proto)
    }
}
