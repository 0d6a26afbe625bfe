use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::DownloadError;
use crate::net::{BodyResponse, HeadResponse, HttpClient, HttpRequest};

#[derive(Default)]
struct FakeState {
    disable_ranges: bool,
    ignore_ranges: bool,
    forced_status: u16,
    chunk_delay: Duration,
    fail_next_body_after: Option<usize>,
    log: Vec<HttpRequest>,
}

/// Scripted in-memory server: serves one blob, honors (or deliberately
/// mishandles) ranges, and can inject failures mid-body.
pub struct FakeHttpClient {
    data: Vec<u8>,
    state: Mutex<FakeState>,
}

impl FakeHttpClient {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// HEAD stops advertising `Accept-Ranges: bytes`.
    pub fn disable_ranges(&self) {
        self.state.lock().unwrap().disable_ranges = true;
    }

    /// Ranges stay advertised but every ranged GET gets 200 + full body.
    pub fn ignore_ranges(&self) {
        self.state.lock().unwrap().ignore_ranges = true;
    }

    /// Every request answers with this status (0 restores normal serving).
    pub fn force_status(&self, status: u16) {
        self.state.lock().unwrap().forced_status = status;
    }

    pub fn chunk_delay(&self, delay: Duration) {
        self.state.lock().unwrap().chunk_delay = delay;
    }

    /// The next GET body drops the connection after `bytes` bytes.
    pub fn fail_body_after(&self, bytes: usize) {
        self.state.lock().unwrap().fail_next_body_after = Some(bytes);
    }

    pub fn request_log(&self) -> Vec<HttpRequest> {
        self.state.lock().unwrap().log.clone()
    }
}

impl HttpClient for FakeHttpClient {
    fn head(&self, req: &HttpRequest) -> Result<HeadResponse, DownloadError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(req.clone());
        let status = if state.forced_status != 0 {
            state.forced_status
        } else {
            200
        };
        Ok(HeadResponse {
            status,
            content_length: Some(self.data.len() as i64),
            accept_ranges: !state.disable_ranges,
            content_type: Some("application/octet-stream".to_string()),
            content_disposition: None,
            etag: Some("\"fake-etag\"".to_string()),
            last_modified: None,
            content_encoding: None,
            final_url: req.url.clone(),
        })
    }

    fn get(&self, req: &HttpRequest) -> Result<BodyResponse, DownloadError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(req.clone());

        if state.forced_status != 0 {
            return Ok(BodyResponse {
                status: state.forced_status,
                content_length: None,
                body: Box::new(std::io::empty()),
            });
        }

        let (status, slice) = match req.range {
            Some((start, end)) if !state.ignore_ranges => {
                let start = start.max(0) as usize;
                if start >= self.data.len() && !self.data.is_empty() {
                    return Ok(BodyResponse {
                        status: 416,
                        content_length: None,
                        body: Box::new(std::io::empty()),
                    });
                }
                let end = (end as usize).min(self.data.len().saturating_sub(1));
                (206u16, self.data[start..=end].to_vec())
            }
            _ => (200u16, self.data.clone()),
        };

        let fail_after = state.fail_next_body_after.take();
        let delay = state.chunk_delay;
        let length = slice.len() as i64;
        Ok(BodyResponse {
            status,
            content_length: Some(length),
            body: Box::new(FakeBody {
                data: slice,
                pos: 0,
                fail_after,
                delay,
            }),
        })
    }
}

struct FakeBody {
    data: Vec<u8>,
    pos: usize,
    fail_after: Option<usize>,
    delay: Duration,
}

impl Read for FakeBody {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.data.len() {
            return Ok(0);
        }
        if let Some(fail_at) = self.fail_after {
            if self.pos >= fail_at {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                ));
            }
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let mut n = buf.len().min(self.data.len() - self.pos);
        if let Some(fail_at) = self.fail_after {
            n = n.min(fail_at - self.pos);
        }
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
