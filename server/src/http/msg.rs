use crate::service::Ssm;

#[derive(Debug)]
pub enum HttpMsg {
    _Status,
    // possible method to stop messages from piling up when the upstream
    // has an external issue
    _UpstreamFailure,
}

impl From<HttpMsg> for Ssm {
    fn from(msg: HttpMsg) -> Self {
        Ssm::Http(msg)
    }
}
