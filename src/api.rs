mod middleware;
mod routes;

pub use middleware::log_request_errors;
pub use routes::{
    SubmitResponse, ThumbnailStatusResponse, ThumbnailsResponse, get_thumbnail, list_thumbnails,
    refresh_thumbnail, submit_thumbnails,
};
