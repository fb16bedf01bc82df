//! 端口分配器
//!
//! 在配置的端口范围内按升序探测空闲端口。已分配给存活部署的端口会被预留，
//! 直到部署停止、失败或被删除，避免两个部署在子进程绑定前拿到同一端口。

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::ops::Range;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::error::DeployError;

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// 端口探测方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortProbe {
    /// 能绑定即视为空闲
    Bind,
    /// 连接失败（无人监听）即视为空闲
    Connect,
}

impl FromStr for PortProbe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bind" => Ok(PortProbe::Bind),
            "connect" => Ok(PortProbe::Connect),
            other => Err(format!("unknown port probe '{}'", other)),
        }
    }
}

impl PortProbe {
    /// 端口当前是否空闲
    pub fn is_free(&self, port: u16) -> bool {
        match self {
            PortProbe::Bind => {
                TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).is_ok()
            }
            PortProbe::Connect => {
                let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
                TcpStream::connect_timeout(&addr, CONNECT_PROBE_TIMEOUT).is_err()
            }
        }
    }
}

/// 按顺序返回第一个空闲端口
pub fn find_free_port(ports: impl IntoIterator<Item = u16>, probe: PortProbe) -> Option<u16> {
    ports.into_iter().find(|port| probe.is_free(*port))
}

/// 带预留表的端口分配器
pub struct PortAllocator {
    range: Range<u16>,
    probe: PortProbe,
    reserved: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: Range<u16>, probe: PortProbe) -> Self {
        Self {
            range,
            probe,
            reserved: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn range(&self) -> Range<u16> {
        self.range.clone()
    }

    /// 分配并预留一个端口
    ///
    /// 预留表锁在整个扫描期间持有，两个并发分配不会得到同一端口
    pub fn allocate(&self) -> Result<u16, DeployError> {
        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| DeployError::PipelineInternal("port table poisoned".to_string()))?;

        let candidates = self.range.clone().filter(|port| !reserved.contains(port));
        let port = find_free_port(candidates, self.probe)
            .ok_or(DeployError::NoPortAvailable {
                start: self.range.start,
                end: self.range.end,
            })?;

        reserved.insert(port);
        debug!(port, "Port reserved");
        Ok(port)
    }

    /// 在阻塞线程池中分配端口
    ///
    /// connect 探测每个端口最多阻塞 200ms，不能放在异步工作线程上执行
    pub async fn allocate_blocking(self: Arc<Self>) -> Result<u16, DeployError> {
        tokio::task::spawn_blocking(move || self.allocate())
            .await
            .map_err(|e| DeployError::PipelineInternal(format!("port scan task failed: {}", e)))?
    }

    /// 释放预留
    pub fn release(&self, port: u16) {
        if let Ok(mut reserved) = self.reserved.lock() {
            if reserved.remove(&port) {
                debug!(port, "Port released");
            }
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved
            .lock()
            .map(|reserved| reserved.contains(&port))
            .unwrap_or(false)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 找一段当前空闲的端口区间，避免与本机其它服务冲突
    fn free_range(len: u16) -> Range<u16> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = listener.local_addr().unwrap().port();
        drop(listener);
        let start = if base > 60000 { base - len } else { base };
        start..start + len
    }

    #[test]
    fn test_probe_parse() {
        assert_eq!("connect".parse::<PortProbe>(), Ok(PortProbe::Connect));
        assert_eq!(" BIND ".parse::<PortProbe>(), Ok(PortProbe::Bind));
        assert!("unknown".parse::<PortProbe>().is_err());
    }

    #[test]
    fn test_bind_probe_skips_busy_port() {
        let busy = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = busy.local_addr().unwrap().port();

        assert!(!PortProbe::Bind.is_free(port));
        assert_eq!(find_free_port(port..port + 1, PortProbe::Bind), None);
        assert_eq!(find_free_port([port, port + 1], PortProbe::Bind), Some(port + 1));
    }

    #[test]
    fn test_connect_probe_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!PortProbe::Connect.is_free(port));
        drop(listener);
        assert!(PortProbe::Connect.is_free(port));
    }

    #[test]
    fn test_allocate_never_hands_out_reserved_port() {
        let allocator = PortAllocator::new(free_range(20), PortProbe::Bind);

        let first = allocator.allocate().unwrap();
        let second = allocator.allocate().unwrap();
        assert_ne!(first, second);
        assert!(second > first);
        assert!(allocator.is_reserved(first));
        assert_eq!(allocator.reserved_count(), 2);

        allocator.release(first);
        assert!(!allocator.is_reserved(first));
        assert_eq!(allocator.allocate().unwrap(), first);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_connect_scan_runs_off_the_runtime() {
        let allocator = Arc::new(PortAllocator::new(free_range(5), PortProbe::Connect));

        // 单线程运行时上，扫描期间计时任务仍能推进
        let ticker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            true
        });
        let port = allocator.clone().allocate_blocking().await.unwrap();
        assert!(ticker.await.unwrap());
        assert!(allocator.is_reserved(port));

        let second = allocator.clone().allocate_blocking().await.unwrap();
        assert_ne!(port, second);
    }

    #[test]
    fn test_allocate_exhausted_range() {
        let range = free_range(2);
        let allocator = PortAllocator::new(range.clone(), PortProbe::Bind);
        allocator.allocate().unwrap();
        allocator.allocate().unwrap();

        match allocator.allocate() {
            Err(DeployError::NoPortAvailable { start, end }) => {
                assert_eq!(start, range.start);
                assert_eq!(end, range.end);
            }
            other => panic!("expected NoPortAvailable, got {:?}", other),
        }
    }
}
