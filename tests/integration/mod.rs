mod support;

mod dns;
mod lifecycle;
mod sessions;
mod tcp_echo;
