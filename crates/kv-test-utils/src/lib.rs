mod resp_client;

pub use resp_client::RespClient;
