//! Typed columnar output tables. Rows are appended only by the transfer
//! stage; readers take snapshots through the shared handle.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpRow {
    pub time_ns: u64,
    pub tgid: u32,
    pub fd: u32,
    pub remote_addr: String,
    pub remote_port: u16,
    pub http_major_version: u8,
    pub http_minor_version: u8,
    pub http_req_method: String,
    pub http_req_path: String,
    pub http_req_headers: String,
    pub http_req_body: String,
    pub http_resp_status: u16,
    pub http_resp_message: String,
    pub http_resp_headers: String,
    pub http_resp_body: String,
    pub http_resp_latency_ns: u64,
}

/// `http_events` table, one Vec per column.
#[derive(Debug, Default)]
pub struct HttpTable {
    pub time_ns: Vec<u64>,
    pub tgid: Vec<u32>,
    pub fd: Vec<u32>,
    pub remote_addr: Vec<String>,
    pub remote_port: Vec<u16>,
    pub http_major_version: Vec<u8>,
    pub http_minor_version: Vec<u8>,
    pub http_req_method: Vec<String>,
    pub http_req_path: Vec<String>,
    pub http_req_headers: Vec<String>,
    pub http_req_body: Vec<String>,
    pub http_resp_status: Vec<u16>,
    pub http_resp_message: Vec<String>,
    pub http_resp_headers: Vec<String>,
    pub http_resp_body: Vec<String>,
    pub http_resp_latency_ns: Vec<u64>,
}

impl HttpTable {
    pub fn append(&mut self, row: HttpRow) {
        self.time_ns.push(row.time_ns);
        self.tgid.push(row.tgid);
        self.fd.push(row.fd);
        self.remote_addr.push(row.remote_addr);
        self.remote_port.push(row.remote_port);
        self.http_major_version.push(row.http_major_version);
        self.http_minor_version.push(row.http_minor_version);
        self.http_req_method.push(row.http_req_method);
        self.http_req_path.push(row.http_req_path);
        self.http_req_headers.push(row.http_req_headers);
        self.http_req_body.push(row.http_req_body);
        self.http_resp_status.push(row.http_resp_status);
        self.http_resp_message.push(row.http_resp_message);
        self.http_resp_headers.push(row.http_resp_headers);
        self.http_resp_body.push(row.http_resp_body);
        self.http_resp_latency_ns.push(row.http_resp_latency_ns);
        debug_assert_eq!(self.time_ns.len(), self.http_resp_latency_ns.len());
    }

    pub fn len(&self) -> usize {
        self.time_ns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_ns.is_empty()
    }

    /// Reassembles row `i` from the columns; test and export convenience.
    pub fn row(&self, i: usize) -> HttpRow {
        HttpRow {
            time_ns: self.time_ns[i],
            tgid: self.tgid[i],
            fd: self.fd[i],
            remote_addr: self.remote_addr[i].clone(),
            remote_port: self.remote_port[i],
            http_major_version: self.http_major_version[i],
            http_minor_version: self.http_minor_version[i],
            http_req_method: self.http_req_method[i].clone(),
            http_req_path: self.http_req_path[i].clone(),
            http_req_headers: self.http_req_headers[i].clone(),
            http_req_body: self.http_req_body[i].clone(),
            http_resp_status: self.http_resp_status[i],
            http_resp_message: self.http_resp_message[i].clone(),
            http_resp_headers: self.http_resp_headers[i].clone(),
            http_resp_body: self.http_resp_body[i].clone(),
            http_resp_latency_ns: self.http_resp_latency_ns[i],
        }
    }

    pub fn take(&mut self) -> HttpTable {
        std::mem::take(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MysqlRow {
    pub time_ns: u64,
    pub tgid: u32,
    pub fd: u32,
    pub remote_addr: String,
    pub remote_port: u16,
    pub mysql_cmd: String,
    pub mysql_body: String,
    pub mysql_resp_body: String,
    pub mysql_resp_status: u16,
    pub mysql_resp_latency_ns: u64,
}

/// `mysql_events` table, one Vec per column.
#[derive(Debug, Default)]
pub struct MysqlTable {
    pub time_ns: Vec<u64>,
    pub tgid: Vec<u32>,
    pub fd: Vec<u32>,
    pub remote_addr: Vec<String>,
    pub remote_port: Vec<u16>,
    pub mysql_cmd: Vec<String>,
    pub mysql_body: Vec<String>,
    pub mysql_resp_body: Vec<String>,
    pub mysql_resp_status: Vec<u16>,
    pub mysql_resp_latency_ns: Vec<u64>,
}

impl MysqlTable {
    pub fn append(&mut self, row: MysqlRow) {
        self.time_ns.push(row.time_ns);
        self.tgid.push(row.tgid);
        self.fd.push(row.fd);
        self.remote_addr.push(row.remote_addr);
        self.remote_port.push(row.remote_port);
        self.mysql_cmd.push(row.mysql_cmd);
        self.mysql_body.push(row.mysql_body);
        self.mysql_resp_body.push(row.mysql_resp_body);
        self.mysql_resp_status.push(row.mysql_resp_status);
        self.mysql_resp_latency_ns.push(row.mysql_resp_latency_ns);
        debug_assert_eq!(self.time_ns.len(), self.mysql_resp_latency_ns.len());
    }

    pub fn len(&self) -> usize {
        self.time_ns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_ns.is_empty()
    }

    pub fn row(&self, i: usize) -> MysqlRow {
        MysqlRow {
            time_ns: self.time_ns[i],
            tgid: self.tgid[i],
            fd: self.fd[i],
            remote_addr: self.remote_addr[i].clone(),
            remote_port: self.remote_port[i],
            mysql_cmd: self.mysql_cmd[i].clone(),
            mysql_body: self.mysql_body[i].clone(),
            mysql_resp_body: self.mysql_resp_body[i].clone(),
            mysql_resp_status: self.mysql_resp_status[i],
            mysql_resp_latency_ns: self.mysql_resp_latency_ns[i],
        }
    }

    pub fn take(&mut self) -> MysqlTable {
        std::mem::take(self)
    }
}

#[derive(Debug, Default)]
pub struct OutputTables {
    pub http: HttpTable,
    pub mysql: MysqlTable,
}

pub type SharedTables = Arc<Mutex<OutputTables>>;

pub fn shared_tables() -> SharedTables {
    Arc::new(Mutex::new(OutputTables::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_keeps_columns_aligned() {
        let mut table = HttpTable::default();
        table.append(HttpRow {
            time_ns: 1,
            http_req_method: "GET".into(),
            ..Default::default()
        });
        table.append(HttpRow {
            time_ns: 2,
            http_req_method: "POST".into(),
            ..Default::default()
        });
        assert_eq!(table.len(), 2);
        assert_eq!(table.row(1).http_req_method, "POST");
        let drained = table.take();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
    }
}
