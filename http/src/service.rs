//! async service trait for request handling.

use core::future::Future;

use std::{boxed::Box, rc::Rc, sync::Arc};

/// Trait for a stateful async function from `Req` to `Result<Response, Error>`.
/// The returned future may borrow from `&self`.
pub trait Service<Req = ()> {
    type Response;
    type Error;

    fn call(&self, req: Req) -> impl Future<Output = Result<Self::Response, Self::Error>>;
}

macro_rules! impl_pointer {
    ($pointer: ident) => {
        impl<S, Req> Service<Req> for $pointer<S>
        where
            S: Service<Req> + ?Sized,
        {
            type Response = S::Response;
            type Error = S::Error;

            fn call(&self, req: Req) -> impl Future<Output = Result<Self::Response, Self::Error>> {
                (**self).call(req)
            }
        }
    };
}

impl_pointer!(Box);
impl_pointer!(Rc);
impl_pointer!(Arc);

/// construct a [Service] from an async closure.
pub fn fn_service<F, Req, Fut, Res, Err>(f: F) -> FnService<F>
where
    F: Fn(Req) -> Fut,
    Fut: Future<Output = Result<Res, Err>>,
{
    FnService(f)
}

#[derive(Clone)]
pub struct FnService<F>(F);

impl<F, Req, Fut, Res, Err> Service<Req> for FnService<F>
where
    F: Fn(Req) -> Fut,
    Fut: Future<Output = Result<Res, Err>>,
{
    type Response = Res;
    type Error = Err;

    fn call(&self, req: Req) -> impl Future<Output = Result<Self::Response, Self::Error>> {
        (self.0)(req)
    }
}
