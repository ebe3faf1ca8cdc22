pub mod redirect_stub;
