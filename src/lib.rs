/*!
A library for conducting HotSync sessions with Palm OS handhelds, over a
serial cradle, a USB-as-serial port, or TCP ("NetSync").

Talking to a handheld means climbing a small protocol stack:

```text
  DLP      typed request/response RPC (one call = one message)
   |
  PADP     reliable delivery: fragmentation, ACKs, retries    \  serial
   |                                                           } cradles
  SLP      framed datagrams with ports and a CRC              /
   |
  byte stream (serial / USB-as-serial)

  ...or, on NetSync-capable devices (TCP sync and the USB M50x
  class), DLP rides a simple length-prefixed framing directly:

  DLP -> NetSync framing -> byte stream (TCP or USB-as-serial)
```

A [`Connection`] owns the transport and every layer of session state,
composed bottom-up at open time and torn down in reverse on close. The
typical session:

```no_run
use pconn::{packet_type, port, Connection, SlpAddr};
use pconn::transport::serial::SerialOptions;

# fn main() -> pconn::Result<()> {
let mut conn = Connection::open_serial("/dev/ttyUSB0", SerialOptions::default())?;
conn.bind(SlpAddr { protocol: packet_type::PAD, port: port::DLP });
conn.accept()?;

let info = conn.read_user_info()?;
println!("hello, {}", String::from_utf8_lossy(&info.username));

conn.end_of_sync(pconn::sync_end::NORMAL)?;
conn.close()?;
# Ok(())
# }
```

The typed DLP wrappers ([`Connection::read_user_info`] and friends)
cover the calls a sync needs; anything else can be sent through
[`Connection::dlp_request`] directly. The lower layers ([`slp::Slp`],
[`padp::Padp`], [`netsync::NetSync`]) are public too, for tools that
need to speak them without DLP on top.
*/

mod conn;
mod crc;
pub mod dlp;
mod dlp_cmd;
mod error;
pub mod netsync;
pub mod padp;
pub mod slp;
pub mod transport;
mod util;

pub use conn::{Connection, ProtocolStack, Status};
pub use dlp::{DlpArg, DlpResponse, DlpStatus};
pub use dlp_cmd::*;
pub use error::{Error, ErrorKind, ProtocolError, Result};
pub use netsync::Wakeup;
pub use slp::{packet_type, port, SlpAddr};
pub use transport::net::NetConfig;
