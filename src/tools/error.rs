/// Generic FLUTE error
///
/// Carries an `std::io::ErrorKind` so callers can tell a malformed packet
/// (`InvalidData`) from a missed deadline (`TimedOut`) or a FEC
/// configuration problem (`InvalidInput`) without a parallel enum.
#[derive(Debug)]
pub struct FluteError(pub std::io::Error);

///
pub type Result<T> = std::result::Result<T, FluteError>;

impl FluteError {
    /// Return a new FLUTE error with a message
    pub fn new<E>(msg: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>> + std::fmt::Debug,
    {
        FluteError(std::io::Error::new(std::io::ErrorKind::Other, msg))
    }

    /// Return a new FLUTE error of a specific kind
    pub fn new_kind<E>(kind: std::io::ErrorKind, msg: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>> + std::fmt::Debug,
    {
        FluteError(std::io::Error::new(kind, msg))
    }

    /// The underlying error kind
    pub fn kind(&self) -> std::io::ErrorKind {
        self.0.kind()
    }
}

impl std::fmt::Display for FluteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for FluteError {}

impl From<std::io::Error> for FluteError {
    fn from(err: std::io::Error) -> Self {
        FluteError(err)
    }
}
