pub use self::{mr_lock::MrLock, sema::Sema};

mod mr_lock;
mod sema;
