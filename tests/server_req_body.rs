use h1_bridge::{Error, RequestContext, ServerConfig};
use http::StatusCode;
use sha1::{Digest, Sha1};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod common;

use common::ResponseReader;

fn random_data(len: usize) -> Vec<u8> {
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    (0..len).map(|_| rng.u8(..)).collect()
}

fn hex_digest(data: &[u8]) -> String {
    format!("{:x}", Sha1::digest(data))
}

#[test]
fn chunked_upload_digest() -> Result<(), Error> {
    const SIZE: usize = 4 * 1024 * 1024;

    let server = common::start(|mut ctx: RequestContext| -> Result<(), Error> {
        let mut rng = fastrand::Rng::with_seed(42);
        let mut hasher = Sha1::new();
        let mut buf = vec![0_u8; 64 * 1024];
        let mut total = 0;
        loop {
            // odd read sizes so reads straddle the chunks
            let max = rng.usize(1..buf.len());
            let n = ctx.entity().read(&mut buf[..max])?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n;
        }
        assert_eq!(total, SIZE);
        let digest = format!("{:x}", hasher.finalize());
        common::reply(&ctx, StatusCode::OK, digest.as_bytes())
    });

    let data = random_data(SIZE);
    let expected = hex_digest(&data);

    let mut tcp = common::connect(&server)?;
    tcp.write_all(b"POST /upload HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n")?;

    let mut rng = fastrand::Rng::with_seed(7);
    let mut rest = &data[..];
    while !rest.is_empty() {
        let n = rng.usize(1..=32 * 1024).min(rest.len());
        write!(tcp, "{:x}\r\n", n)?;
        tcp.write_all(&rest[..n])?;
        tcp.write_all(b"\r\n")?;
        rest = &rest[n..];
    }
    tcp.write_all(b"0\r\n\r\n")?;

    let mut reader = ResponseReader::new(tcp);
    let res = reader.read_response()?.unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), expected);

    Ok(())
}

#[test]
fn fixed_length_upload() -> Result<(), Error> {
    let server = common::start(common::echo);

    let data = random_data(300_000);

    let mut tcp = common::connect(&server)?;
    write!(tcp, "PUT /blob HTTP/1.1\r\ncontent-length: {}\r\n\r\n", data.len())?;
    tcp.write_all(&data)?;

    let mut reader = ResponseReader::new(tcp);
    let res = reader.read_response()?.unwrap();
    assert_eq!(res.body.len(), data.len());
    assert!(res.body == data);

    Ok(())
}

#[test]
fn slow_reader_bounds_buffering() -> Result<(), Error> {
    const SIZE: usize = 1024 * 1024;
    const HIGH: usize = 32 * 1024;

    let config = ServerConfig {
        high_watermark: HIGH,
        low_watermark: 8 * 1024,
        ..common::config()
    };

    let max_available = Arc::new(AtomicUsize::new(0));
    let max = max_available.clone();

    let server = common::start_with(config, move |mut ctx: RequestContext| -> Result<(), Error> {
        let mut buf = [0_u8; 4096];
        let mut total = 0;
        loop {
            max.fetch_max(ctx.entity().available(), Ordering::SeqCst);
            let n = ctx.entity().read(&mut buf)?;
            if n == 0 {
                break;
            }
            total += n;
            std::thread::sleep(Duration::from_micros(500));
        }
        common::reply(&ctx, StatusCode::OK, total.to_string().as_bytes())
    });

    let tcp = common::connect(&server)?;
    let mut writer = tcp.try_clone()?;

    let t = std::thread::spawn(move || -> std::io::Result<()> {
        write!(writer, "POST / HTTP/1.1\r\ncontent-length: {}\r\n\r\n", SIZE)?;
        writer.write_all(&vec![b'x'; SIZE])
    });

    let mut reader = ResponseReader::new(tcp.try_clone()?);
    let res = reader.read_response()?.unwrap();
    assert_eq!(res.body_str(), SIZE.to_string());
    t.join().unwrap()?;

    // one socket read may go past the high watermark before reading stops
    let seen = max_available.load(Ordering::SeqCst);
    assert!(seen > 0);
    assert!(seen <= HIGH + 16 * 1024, "buffered {} bytes", seen);

    tcp.shutdown(std::net::Shutdown::Write)?;
    Ok(())
}

#[test]
fn early_response_discards_body() -> Result<(), Error> {
    let reads = Arc::new(AtomicUsize::new(0));
    let r = reads.clone();

    let server = common::start(move |mut ctx: RequestContext| -> Result<(), Error> {
        if ctx.uri().path() == "/reject" {
            // answer without looking at the body
            ctx.entity().close();
            return common::reply(&ctx, StatusCode::PAYLOAD_TOO_LARGE, b"too big");
        }
        r.fetch_add(1, Ordering::SeqCst);
        common::echo(ctx)
    });

    let tcp = common::connect(&server)?;
    let mut writer = tcp.try_clone()?;

    let t = std::thread::spawn(move || -> std::io::Result<()> {
        let body = vec![b'z'; 500_000];
        write!(writer, "POST /reject HTTP/1.1\r\ncontent-length: {}\r\n\r\n", body.len())?;
        writer.write_all(&body)?;
        writer.write_all(b"POST /echo HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello")
    });

    let mut reader = ResponseReader::new(tcp.try_clone()?);

    let res = reader.read_response()?.unwrap();
    assert_eq!(res.status, 413);
    assert_eq!(res.body, b"too big");
    assert!(res.header("connection").is_none());

    // the rejected body was skipped, the connection is still in sync
    let res = reader.read_response()?.unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"hello");
    assert_eq!(reads.load(Ordering::SeqCst), 1);

    t.join().unwrap()?;
    tcp.shutdown(std::net::Shutdown::Write)?;

    Ok(())
}

#[test]
fn body_length_is_enforced_on_reads() -> Result<(), Error> {
    let server = common::start(|mut ctx: RequestContext| -> Result<(), Error> {
        let mut body = String::new();
        ctx.entity().read_to_string(&mut body)?;
        assert!(ctx.entity().is_input_completed());
        common::reply(&ctx, StatusCode::OK, body.to_uppercase().as_bytes())
    });

    // the pipelined request right after the body is not part of it
    let mut tcp = common::connect(&server)?;
    tcp.write_all(
        b"POST / HTTP/1.1\r\ncontent-length: 3\r\n\r\nabcGET / HTTP/1.1\r\nconnection: close\r\n\r\n",
    )?;

    let mut reader = ResponseReader::new(tcp);
    assert_eq!(reader.read_response()?.unwrap().body, b"ABC");
    assert_eq!(reader.read_response()?.unwrap().body, b"");
    assert!(reader.is_eof());

    Ok(())
}
