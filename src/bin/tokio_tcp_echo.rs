use std::{env::args, time::Instant};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    println!("tokio tcp echo");

    let listen = args().nth(1).unwrap_or("[::0]:1234".to_string());
    let socket = TcpListener::bind(listen.as_str()).await?;

    while let Ok((mut stream, addr)) = socket.accept().await {
        println!("+ {addr}");

        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            let start = Instant::now();
            let mut bytes = 0u64;

            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        bytes += n as u64;
                        if let Err(e) = stream.write_all(&buf[..n]).await {
                            eprintln!("unable to echo data: {e}");
                            break;
                        }
                    }
                }
            }

            let time = start.elapsed();
            let mbytes = bytes as f64 / 1024.0 / 1024.0;
            println!("- {addr} ({mbytes:.2} MByte echoed in {time:.2?})");
        });
    }

    Ok(())
}
