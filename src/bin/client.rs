use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

use tcp_core::{ip, NetStack, TcpConfig};

fn main() {
    env_logger::init();

    let (sender, receiver) = ip::open_tun(
        "tun1",
        Ipv4Addr::from_str("10.10.10.11").unwrap(),
        Ipv4Addr::from_str("255.255.255.0").unwrap(),
    )
    .unwrap();

    let netstack = NetStack::new(
        Ipv4Addr::from_str("10.10.10.11").unwrap().into(),
        sender,
        receiver,
        TcpConfig::default(),
    );

    println!(">>> Trying to connect to server...");
    let remote: SocketAddr = "10.10.10.10:9090".parse().unwrap();
    let mut stream = netstack.connect(remote).unwrap();
    println!(">>> Connected!");

    loop {
        let mut buf = [0u8; 1500];
        let n = stream.read(&mut buf[..]).unwrap();

        if n == 0 {
            break;
        }

        stream.write(&buf[..n]).unwrap();

        println!(
            "\n>>> Read: {:?}\n",
            String::from_iter(buf[..n].iter().map(|c| *c as char))
        );
    }
}
