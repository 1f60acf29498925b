use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not open the repository backend")]
    Backend,
    #[display("could not open the progress database")]
    State,
    #[display("discovery failed")]
    Discovery,
    #[display("could not write output")]
    Output,
}
