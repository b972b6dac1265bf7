//! TCP transport for the fabric: a [`Dealer`] for clients making calls, and
//! a [`ReplyServer`] for nodes answering them.

mod dealer;
mod error;
mod framing;
mod server;

pub use dealer::Dealer;
pub use error::TransportError;
pub use framing::{recv_frame, send_frame};
pub use server::{Handler, ReplyServer};

#[cfg(test)]
mod tests {
    use super::*;
    use quickdist_proto::{cmd, Message};
    use std::sync::Arc;

    #[test]
    fn dealer_round_trips_a_call_through_the_reply_server() {
        let mut server = ReplyServer::bind(
            "127.0.0.1:0",
            2,
            Arc::new(|req: Message| {
                if req.cmd == cmd::PING {
                    Message::simple(cmd::PONG)
                } else {
                    Message::error("unexpected command")
                }
            }),
        )
        .unwrap();
        let addr = server.local_addr();

        let dealer = Dealer::connect(&addr.to_string()).unwrap();
        let reply = dealer.call(&Message::simple(cmd::PING)).unwrap();
        assert_eq!(reply.cmd, cmd::PONG);

        let reply = dealer.call(&Message::simple("BOGUS")).unwrap();
        assert!(reply.is_error());

        server.close();
    }

    #[test]
    fn close_request_gets_an_error_reply_not_a_dropped_connection() {
        let mut server = ReplyServer::bind(
            "127.0.0.1:0",
            1,
            Arc::new(|req: Message| {
                if req.cmd == cmd::PING {
                    Message::simple(cmd::PONG)
                } else {
                    Message::error("unexpected command")
                }
            }),
        )
        .unwrap();
        let addr = server.local_addr();

        let dealer = Dealer::connect(&addr.to_string()).unwrap();
        let reply = dealer.call(&Message::simple(cmd::CLOSE)).unwrap();
        assert!(reply.is_error());

        // the connection is still alive after a refused CLOSE
        let reply = dealer.call(&Message::simple(cmd::PING)).unwrap();
        assert_eq!(reply.cmd, cmd::PONG);

        server.close();
    }
}
