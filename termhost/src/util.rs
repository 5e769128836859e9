//! Small helpers shared across modules.

use std::io::{self, Read};
use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::debug;

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if let Some(rest) = path.strip_prefix("~/") {
                expanded.push(rest);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

/// Forward what `reader` produces to the returned channel, one block of at
/// most `block` bytes per message, from a dedicated thread.
///
/// The thread is detached, so a read blocked on a quiet terminal never holds
/// up runtime shutdown. It ends on EOF, on a read error, or once the
/// receiver is dropped.
pub fn spawn_reader<R>(mut reader: R, block: usize) -> io::Result<mpsc::Receiver<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("input-reader".into())
        .spawn(move || {
            let mut buf = vec![0u8; block];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!("Input reader stopped: {e}");
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[test]
    fn test_plain_paths_pass_through() {
        assert_eq!(expand_tilde("/tmp/x"), PathBuf::from("/tmp/x"));
        assert_eq!(expand_tilde("~user/x"), PathBuf::from("~user/x"));
    }

    #[test]
    fn test_home_is_expanded() {
        let Some(home) = std::env::var_os("HOME") else {
            return;
        };
        assert_eq!(expand_tilde("~"), PathBuf::from(&home));
        assert_eq!(expand_tilde("~/work"), PathBuf::from(home).join("work"));
    }

    #[tokio::test]
    async fn test_reader_forwards_blocks_until_eof() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let mut rx = spawn_reader(reader, 64).unwrap();

        writer.write_all(b"keys").unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some(&b"keys"[..]));
        drop(writer);
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_blocked_reader_does_not_delay_shutdown() {
        // The writer stays open, so the reader never sees EOF.
        let (writer, reader) = UnixStream::pair().unwrap();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let _input = spawn_reader(reader, 64).unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            });
            drop(rt);
            let _ = done_tx.send(());
        });
        assert!(
            done_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
            "runtime shutdown waited for input"
        );
        drop(writer);
    }
}
