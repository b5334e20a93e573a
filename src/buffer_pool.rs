use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::config::Config;
use crate::connection::Connection;

/// Pool of MTU-sized read buffers. Buffers always have their full length available so a
/// socket read can fill them directly; callers slice to the received length.
pub(crate) struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> BufferPool {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self) -> Vec<u8> {
        if let Some(buffer) = self.buffers.lock().unwrap().pop() {
            trace!("reusing pooled read buffer");
            return buffer;
        }

        vec![0; self.buf_size]
    }

    pub fn return_to_pool(&self, buffer: Vec<u8>) {
        debug_assert_eq!(buffer.len(), self.buf_size);

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            buffers.push(buffer);
        }
    }
}

/// Pool of connection records, bounding allocation churn under connect/disconnect load.
/// Records handed back must be fully [`Connection::reset`]; the pool hands them out
/// as-is.
pub(crate) struct ConnectionPool {
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl ConnectionPool {
    pub fn new(max_pool_size: usize) -> ConnectionPool {
        ConnectionPool {
            connections: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self, config: &Arc<Config>) -> Arc<Connection> {
        if let Some(connection) = self.connections.lock().unwrap().pop() {
            trace!("reusing pooled connection record");
            return connection;
        }

        Connection::new_arc(config.clone())
    }

    pub fn return_to_pool(&self, connection: Arc<Connection>) {
        let mut connections = self.connections.lock().unwrap();
        if connections.capacity() > connections.len() {
            connections.push(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_round_trip() {
        let pool = BufferPool::new(16, 4);

        let mut buffer = pool.get_from_pool();
        assert_eq!(buffer.len(), 16);
        buffer[0] = 99;
        pool.return_to_pool(buffer);

        // pooled buffers keep their full length
        let again = pool.get_from_pool();
        assert_eq!(again.len(), 16);
    }

    #[test]
    fn test_buffer_pool_bounded() {
        let pool = BufferPool::new(8, 2);

        let buffers = (0..4).map(|_| pool.get_from_pool()).collect::<Vec<_>>();
        for buffer in buffers {
            pool.return_to_pool(buffer);
        }

        assert!(pool.buffers.lock().unwrap().len() <= 2);
    }

    #[test]
    fn test_connection_pool_reuses_record() {
        let config = Arc::new(Config::default());
        let pool = ConnectionPool::new(2);

        let connection = pool.get_from_pool(&config);
        let ptr = Arc::as_ptr(&connection);
        pool.return_to_pool(connection);

        let again = pool.get_from_pool(&config);
        assert_eq!(Arc::as_ptr(&again), ptr);
    }
}
