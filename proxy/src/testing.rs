//! Test helpers: backend message builders, scripted backends and log capture

use crate::backend::ServerConnection;
use crate::protocol::MessageFormatter;
use crate::router::Route;
use bytes::{BufMut, Bytes, BytesMut};
use log::{Level, LevelFilter, Log, Metadata, Record};
use pgpooler_core::{IdGenerator, RouteConfig, StorageConfig};
use std::cell::RefCell;
use std::sync::{Arc, Once};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

/// Frame a backend message with the given tag
pub fn backend_message<F>(tag: u8, body: F) -> Bytes
where
    F: FnOnce(&mut BytesMut),
{
    let mut buf = BytesMut::new();
    MessageFormatter::new().write_message_with_type(&mut buf, tag, body);
    buf.freeze()
}

pub fn row_description(columns: &[&str]) -> Bytes {
    backend_message(b'T', |buf| {
        buf.put_i16(columns.len() as i16);
        for column in columns {
            buf.put_slice(column.as_bytes());
            buf.put_u8(0);
            buf.put_i32(0); // table oid
            buf.put_i16(0); // attribute number
            buf.put_i32(25); // text
            buf.put_i16(-1);
            buf.put_i32(-1);
            buf.put_i16(0);
        }
    })
}

pub fn data_row<T: AsRef<[u8]>>(columns: &[Option<T>]) -> Bytes {
    backend_message(b'D', |buf| {
        buf.put_u32(columns.len() as u32);
        for column in columns {
            match column {
                Some(value) => {
                    let value = value.as_ref();
                    buf.put_u32(value.len() as u32);
                    buf.put_slice(value);
                }
                None => buf.put_u32(u32::MAX),
            }
        }
    })
}

pub fn ready_for_query(status: u8) -> Bytes {
    backend_message(b'Z', |buf| buf.put_u8(status))
}

pub fn error_response(code: &str, message: &str) -> Bytes {
    backend_message(b'E', |buf| {
        for (field, value) in [(b'S', "ERROR"), (b'C', code), (b'M', message)] {
            buf.put_u8(field);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
        }
        buf.put_u8(0);
    })
}

pub fn command_complete(command: &str) -> Bytes {
    backend_message(b'C', |buf| {
        buf.put_slice(command.as_bytes());
        buf.put_u8(0);
    })
}

/// Route `auth_db.auth_user` on a local storage
pub fn test_route(pool_discard: bool) -> Route {
    route_on_port(5432, pool_discard)
}

pub fn route_on_port(port: u16, pool_discard: bool) -> Route {
    let storage = StorageConfig {
        host: "127.0.0.1".to_string(),
        port,
        database: None,
        user: None,
        password: None,
    };
    let mut config = RouteConfig::new("auth_db", "auth_user", storage);
    config.pool_discard = pool_discard;
    Route::new(Arc::new(config))
}

pub fn server(pool_discard: bool) -> ServerConnection {
    server_for(test_route(pool_discard))
}

pub fn server_for(route: Route) -> ServerConnection {
    ServerConnection::new(IdGenerator::new().generate("s"), route)
}

/// Backend that sends `script` and then records everything the pooler writes
/// until the pooler side is dropped
pub fn scripted_stream(script: Vec<Bytes>) -> (DuplexStream, JoinHandle<Vec<u8>>) {
    let (pooler, mut backend) = tokio::io::duplex(64 * 1024);

    let handle = tokio::spawn(async move {
        for message in script {
            if backend.write_all(&message).await.is_err() {
                break;
            }
        }

        let mut received = Vec::new();
        let _ = backend.read_to_end(&mut received).await;
        received
    });

    (pooler, handle)
}

/// Backend that sends `script` and then closes the connection
pub fn closing_stream(script: Vec<Bytes>) -> (DuplexStream, JoinHandle<()>) {
    let (pooler, mut backend) = tokio::io::duplex(64 * 1024);

    let handle = tokio::spawn(async move {
        for message in script {
            if backend.write_all(&message).await.is_err() {
                break;
            }
        }
        let _ = backend.shutdown().await;
    });

    (pooler, handle)
}

thread_local! {
    static RECORDS: RefCell<Vec<(Level, String)>> = RefCell::new(Vec::new());
}

struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        RECORDS.with(|records| {
            records
                .borrow_mut()
                .push((record.level(), record.args().to_string()))
        });
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;
static INIT_LOGGER: Once = Once::new();

/// Start capturing log records emitted on the current thread
pub fn capture_logs() {
    INIT_LOGGER.call_once(|| {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(LevelFilter::Trace);
    });
    RECORDS.with(|records| records.borrow_mut().clear());
}

/// Records captured on the current thread since `capture_logs`
pub fn captured_logs() -> Vec<(Level, String)> {
    RECORDS.with(|records| records.borrow().clone())
}

/// Read a startup packet, returning the body after the length
pub async fn read_startup_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
    let length = reader.read_i32().await.unwrap() as usize;
    let mut body = vec![0u8; length - 4];
    reader.read_exact(&mut body).await.unwrap();
    body
}

/// Read a tagged frontend message, returning its tag and body
pub async fn read_frontend_message<R: AsyncRead + Unpin>(reader: &mut R) -> (u8, Vec<u8>) {
    let tag = reader.read_u8().await.unwrap();
    let length = reader.read_i32().await.unwrap() as usize;
    let mut body = vec![0u8; length - 4];
    reader.read_exact(&mut body).await.unwrap();
    (tag, body)
}

/// Frame an Authentication message
pub fn auth_request(code: i32, extra: &[u8]) -> Bytes {
    backend_message(b'R', |buf| {
        buf.put_i32(code);
        buf.put_slice(extra);
    })
}
