#![allow(warnings)]

include!(concat!(env!("OUT_DIR"), "/rdma-core-bindings.rs"));
