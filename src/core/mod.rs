pub mod body;
pub mod dispatcher;
pub mod error;
pub mod middleware;
pub mod multipart;
pub mod options;
pub mod path_matcher;
pub mod request;
pub mod response;
pub mod route;
pub mod route_table;
pub mod validation;

pub use body::Payload;
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::{ErrorEnvelope, HandlerResult, HttpError, RouteError};
pub use middleware::{
    Handler, Middleware, MiddlewareChain, Next, async_handler_fn, handler_fn, middleware_fn,
};
pub use multipart::{MultipartForm, UploadedFile};
pub use options::{
    AuthOptions, CacheOptions, PayloadOptions, RouteOptions, SecurityOptions, ValidationSchemas,
};
pub use path_matcher::{PathParams, PathPattern};
pub use request::{MatchedRoute, Request};
pub use response::{Response, ResponseError};
pub use route::{MethodSet, Route, Router};
pub use route_table::{RouteLookup, RouteTable};
