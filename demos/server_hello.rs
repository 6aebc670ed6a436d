use h1_bridge::{Error, RecorderMetrics, RequestContext, Server, ServerConfig};
use http::{HeaderMap, HeaderValue, StatusCode};
use std::io::{Read, Write};
use std::sync::Arc;

fn handle(mut ctx: RequestContext) -> Result<(), Error> {
    let mut body = vec![];
    ctx.entity().read_to_end(&mut body)?;

    let reply = format!(
        "Hello {} {}, you sent {} bytes\n",
        ctx.method(),
        ctx.uri(),
        body.len()
    );

    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("text/plain"));

    let mut out = ctx.exchange().write_status_and_headers(
        Some(reply.len() as u64),
        StatusCode::OK,
        headers,
    )?;
    out.write_all(reply.as_bytes())?;

    Ok(())
}

fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let config = ServerConfig {
        port: 3000,
        ..Default::default()
    };

    let server = Server::start_with_metrics(
        config,
        Arc::new(handle),
        Arc::new(RecorderMetrics::default()),
    )?;

    println!("Listening on {}", server.local_addr());

    loop {
        std::thread::park();
    }
}
