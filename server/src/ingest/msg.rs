use crate::service::Ssm;

#[derive(Debug)]
pub enum IngestMsg {
    _Status,
}

impl From<IngestMsg> for Ssm {
    fn from(msg: IngestMsg) -> Self {
        Ssm::Ingest(msg)
    }
}
