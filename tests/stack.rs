//! End-to-end sessions against a scripted handheld.
//!
//! The "device" side runs on its own thread, speaking the lower layers
//! directly (they're public for exactly this kind of tool) while the
//! host side goes through `Connection` like any real caller.

use pconn::padp::Padp;
use pconn::transport::pipe::{self, PipeTransport};
use pconn::transport::{Direction, Transport, Wait};
use pconn::{
    mod_flags, packet_type, port, Connection, DlpTime, Error, ErrorKind, NewUserInfo,
    ProtocolStack, SlpAddr, Status,
};
use std::io;
use std::net::{TcpStream, UdpSocket};
use std::thread;
use std::time::Duration;

const DLP_ADDR: SlpAddr = SlpAddr {
    protocol: packet_type::PAD,
    port: port::DLP,
};

/// A handheld that answers DLP requests from a script.
struct PalmSim {
    padp: Padp,
    io: PipeTransport,
}

impl PalmSim {
    fn new(io: PipeTransport) -> PalmSim {
        let mut padp = Padp::new();
        padp.bind(DLP_ADDR);
        padp.set_read_timeout(Duration::from_secs(5));
        padp.set_ack_timeout(Duration::from_millis(200));
        PalmSim { padp, io }
    }

    /// Serve one request: hand `(cmd, raw argument bytes)` to the script
    /// and send back whatever response body it produces.
    fn serve_one(&mut self, script: impl FnOnce(u8, &[u8]) -> Vec<u8>) {
        let len = self.padp.read(&mut self.io).unwrap();
        let msg = self.padp.message(len).to_vec();
        let cmd = msg[0];
        let response = script(cmd, &msg[2..]);
        self.padp.write(&mut self.io, &response).unwrap();
    }
}

/// Build a DLP response body: header plus tiny/small-shaped arguments.
fn response(cmd: u8, status: u16, args: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut out = vec![cmd | 0x80, args.len() as u8];
    out.extend_from_slice(&status.to_be_bytes());
    for (id, data) in args {
        if data.len() <= 0xff {
            out.push(*id as u8);
            out.push(data.len() as u8);
        } else {
            out.push(*id as u8 | 0x80);
            out.push(0);
            out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(data);
    }
    out
}

fn host_connection(io: PipeTransport) -> Connection {
    let mut conn = Connection::from_transport(Box::new(io), ProtocolStack::Full);
    conn.bind(DLP_ADDR);
    conn.set_read_timeout(Duration::from_secs(5));
    conn.set_ack_timeout(Duration::from_millis(200));
    conn.accept().unwrap();
    conn
}

#[test]
fn get_sys_date_time_over_the_full_stack() {
    let (host_io, palm_io) = pipe::pair();
    let palm = thread::spawn(move || {
        let mut sim = PalmSim::new(palm_io);
        sim.serve_one(|cmd, _| {
            assert_eq!(cmd, 0x13);
            response(cmd, 0, &[(0x20, vec![0x07, 0xe8, 1, 15, 10, 30, 45, 0])])
        });
    });

    let mut conn = host_connection(host_io);
    let time = conn.get_sys_date_time().unwrap();
    assert_eq!(
        time,
        DlpTime {
            year: 2024,
            month: 1,
            day: 15,
            hour: 10,
            minute: 30,
            second: 45,
        }
    );
    palm.join().unwrap();
}

#[test]
fn user_info_write_then_read_round_trips() {
    let (host_io, palm_io) = pipe::pair();
    let palm = thread::spawn(move || {
        let mut sim = PalmSim::new(palm_io);
        let mut stored_name = Vec::new();

        // WriteUserInfo: single tiny argument; the username length is at
        // offset 21 of its data, the name itself follows
        sim.serve_one(|cmd, body| {
            assert_eq!(cmd, 0x11);
            let data = &body[2..]; // skip the tiny arg header
            assert_eq!(data[20], mod_flags::USERNAME);
            let name_len = data[21] as usize;
            stored_name = data[22..22 + name_len].to_vec();
            response(cmd, 0, &[])
        });

        // ReadUserInfo: echo the stored name back
        let name = stored_name;
        sim.serve_one(move |cmd, _| {
            assert_eq!(cmd, 0x10);
            let mut info = Vec::new();
            info.extend_from_slice(&42u32.to_be_bytes()); // userid
            info.extend_from_slice(&0u32.to_be_bytes()); // viewerid
            info.extend_from_slice(&0u32.to_be_bytes()); // last sync PC
            info.extend_from_slice(&[0; 16]); // both sync times: never
            info.push(name.len() as u8);
            info.push(0); // no password
            info.extend_from_slice(&name);
            response(cmd, 0, &[(0x20, info)])
        });
    });

    let mut conn = host_connection(host_io);
    conn.write_user_info(&NewUserInfo {
        modflags: mod_flags::USERNAME,
        username: b"Alice\0".to_vec(),
        ..NewUserInfo::default()
    })
    .unwrap();

    let info = conn.read_user_info().unwrap();
    assert_eq!(info.username.len(), 6);
    assert_eq!(info.username, b"Alice\0");
    assert_eq!(info.userid, 42);
    palm.join().unwrap();
}

#[test]
fn delete_record_flags_reach_the_wire() {
    let (host_io, palm_io) = pipe::pair();
    let palm = thread::spawn(move || {
        let mut sim = PalmSim::new(palm_io);
        sim.serve_one(|cmd, body| {
            assert_eq!(cmd, 0x22); // DeleteRecord
            let data = &body[2..]; // skip the tiny arg header
            assert_eq!(data[0], 1); // handle
            assert_eq!(data[1], pconn::del_rec::CATEGORY);
            assert_eq!(data[2..6], [0, 0, 0, 7]); // category in the low byte
            response(cmd, 0, &[])
        });
    });

    let mut conn = host_connection(host_io);
    conn.delete_record(1, pconn::del_rec::CATEGORY, 7).unwrap();
    palm.join().unwrap();
}

#[test]
fn large_requests_fragment_transparently() {
    let (host_io, palm_io) = pipe::pair();
    let block = vec![0xd7u8; 3000];
    let expected = block.clone();
    let palm = thread::spawn(move || {
        let mut sim = PalmSim::new(palm_io);
        sim.serve_one(|cmd, body| {
            assert_eq!(cmd, 0x1c); // WriteAppBlock
            // small-shape arg: 4-byte header, then handle/unused/len
            let data = &body[4..];
            assert_eq!(&data[4..], &expected[..]);
            response(cmd, 0, &[])
        });
    });

    let mut conn = host_connection(host_io);
    conn.write_app_block(1, &block).unwrap();
    palm.join().unwrap();
}

/// Drops every outbound frame.
struct Blackhole(PipeTransport);

impl Transport for Blackhole {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
    fn write_all(&mut self, _buf: &[u8]) -> io::Result<()> {
        Ok(())
    }
    fn wait(&mut self, dir: Direction, timeout: Duration) -> pconn::Result<Wait> {
        self.0.wait(dir, timeout)
    }
}

#[test]
fn retry_exhaustion_loses_the_connection() {
    let (host_io, _palm_io) = pipe::pair();
    let mut conn = Connection::from_transport(Box::new(Blackhole(host_io)), ProtocolStack::Full);
    conn.bind(DLP_ADDR);
    conn.set_ack_timeout(Duration::from_millis(20));
    conn.set_read_timeout(Duration::from_millis(50));
    conn.accept().unwrap();

    let err = conn.get_sys_date_time().unwrap_err();
    assert!(matches!(err, Error::Timeout), "got {:?}", err);
    assert_eq!(conn.status(), Status::Lost);
    assert_eq!(conn.last_error(), Some(ErrorKind::Timeout));

    // Once lost, the connection refuses further work
    let err = conn.open_conduit().unwrap_err();
    assert!(matches!(err, Error::NotConnected));
}

fn netsync_frame(xid: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x01, xid];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn read_netsync_frame(stream: &mut TcpStream) -> Vec<u8> {
    use std::io::Read;
    let mut header = [0u8; 6];
    stream.read_exact(&mut header).unwrap();
    let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    payload
}

fn free_udp_port() -> u16 {
    UdpSocket::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[test]
fn netsync_wakeup_ritual_and_dlp_exchange() {
    let wakeup_port = free_udp_port();
    let data_port = free_tcp_port();

    let server = thread::spawn(move || {
        let mut conn = Connection::open_net(pconn::NetConfig {
            wakeup_port,
            data_port,
        })
        .unwrap();
        conn.accept().unwrap();
        assert_eq!(conn.status(), Status::Up);
        conn.set_read_timeout(Duration::from_secs(5));
        conn.get_sys_date_time().unwrap()
    });

    // --- The handheld's side, scripted by hand ---

    // Wakeup: magic, type 1, a mystery byte, hostid, netmask, hostname
    let udp = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
    let mut wakeup = vec![0xfa, 0xde, 0x01, 0x99];
    wakeup.extend_from_slice(&0x0a00_0001u32.to_be_bytes());
    wakeup.extend_from_slice(&0xffff_ff00u32.to_be_bytes());
    wakeup.extend_from_slice(b"palm\0");
    udp.send_to(&wakeup, ("127.0.0.1", wakeup_port)).unwrap();

    // The ack preserves everything but the type byte
    let mut ack = [0u8; 64];
    udp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let (n, _) = udp.recv_from(&mut ack).unwrap();
    let mut expected = wakeup.clone();
    expected[2] = 0x02;
    assert_eq!(&ack[..n], &expected[..]);

    // The data connection comes up right after the ack
    let mut stream = loop {
        match TcpStream::connect(("127.0.0.1", data_port)) {
            Ok(s) => break s,
            Err(_) => thread::sleep(Duration::from_millis(20)),
        }
    };

    // Ritual: we open, the desktop answers twice
    use std::io::Write;
    stream
        .write_all(&netsync_frame(1, &[0x90, 0x01, 0, 0, 0, 0]))
        .unwrap();
    let stmt2 = read_netsync_frame(&mut stream);
    assert_eq!(stmt2[0], 0x12);
    stream.write_all(&netsync_frame(2, &[0x92, 0x01])).unwrap();
    let stmt3 = read_netsync_frame(&mut stream);
    assert_eq!(stmt3[0], 0x13);
    stream.write_all(&netsync_frame(3, &[0x93, 0x00])).unwrap();

    // Now a DLP request arrives, NetSync-framed
    let request = read_netsync_frame(&mut stream);
    assert_eq!(request, [0x13, 0x00]); // GetSysDateTime, no args
    let body = response(0x13, 0, &[(0x20, vec![0x07, 0xe8, 1, 15, 10, 30, 45, 0])]);
    stream.write_all(&netsync_frame(4, &body)).unwrap();

    let time = server.join().unwrap();
    assert_eq!(time.year, 2024);
    assert_eq!(time.second, 45);
}
