//! Cached value of the `Date` response header.
//!
//! Formatting an HTTP date on every response is wasteful; the value only
//! changes once per second, so it is rendered once and swapped in
//! atomically when a reader notices the second has changed.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::HeaderValue;
use once_cell::sync::Lazy;

static DATE_SERVICE: Lazy<DateService> = Lazy::new(DateService::new);

#[derive(Debug)]
pub(crate) struct DateService {
    current: ArcSwap<(u64, HeaderValue)>,
}

impl DateService {
    pub(crate) fn global() -> &'static DateService {
        &DATE_SERVICE
    }

    fn new() -> Self {
        let now = unix_seconds();
        Self { current: ArcSwap::from_pointee((now, render())) }
    }

    pub(crate) fn http_date(&self) -> HeaderValue {
        let now = unix_seconds();
        let current = self.current.load();
        if current.0 == now {
            return current.1.clone();
        }

        let value = render();
        self.current.store(Arc::new((now, value.clone())));
        value
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |elapsed| elapsed.as_secs())
}

fn render() -> HeaderValue {
    let mut buf = faf_http_date::get_date_buff_no_key();
    faf_http_date::get_date_no_key(&mut buf);
    HeaderValue::from_maybe_shared(Bytes::from_owner(buf)).unwrap_or_else(|_| HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"))
}
