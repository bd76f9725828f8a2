//! `oc-cli`: a minimal signing client. Loads (or creates) a local identity,
//! builds a request, signs it, and prints the server's response.
//!
//! Usage: oc-cli <server-addr> <key-path> <service> <method> [args...]

use std::io::BufReader;
use std::net::TcpStream;
use std::path::PathBuf;
use std::process;

use oc::ident::Credential;
use oc::msg::{self, OcReq};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 5 {
        eprintln!(
            "Usage: {} <server-addr> <key-path> <service> <method> [args...]",
            args[0]
        );
        process::exit(1);
    }

    let server_addr = &args[1];
    let key_path = PathBuf::from(&args[2]);
    let service = args[3].clone();
    let method = args[4].clone();
    let call_args: Vec<String> = args[5..].to_vec();

    let credential = match Credential::init_or_load(&key_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error loading identity at {}: {}", key_path.display(), e);
            process::exit(1);
        }
    };

    let mut req = OcReq {
        service,
        method,
        args: call_args,
        nonce: fresh_nonce(),
        ..Default::default()
    };
    let digest = req.digest();
    req.id = credential.node_id().0.clone();
    req.sig = credential.sign_prehash_encoded(&digest);

    let mut stream = match TcpStream::connect(server_addr) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("could not connect to {}: {}", server_addr, e);
            process::exit(1);
        }
    };

    if let Err(e) = msg::write_request(&mut stream, &req) {
        eprintln!("error sending request: {}", e);
        process::exit(1);
    }

    let mut reader = BufReader::new(stream);
    match msg::read_response(&mut reader) {
        Ok(resp) => {
            println!("status: {}", resp.status);
            println!("body: {}", String::from_utf8_lossy(&resp.body));
        }
        Err(e) => {
            eprintln!("error reading response: {}", e);
            process::exit(1);
        }
    }
}

/// A per-call nonce. Not a cryptographic requirement here beyond
/// uniqueness-in-practice: the wall-clock plus the process id is enough to
/// keep a single operator's successive calls from colliding.
fn fresh_nonce() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is set before the Unix epoch");
    format!("{}-{}-{}", now.as_secs(), now.subsec_nanos(), process::id())
}
