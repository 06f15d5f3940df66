pub mod kvm_ctx;
pub mod memory;
pub mod vm;
pub mod vcpu;
pub mod exit;
pub mod boot;
pub mod devices;
pub mod event_loop;
pub mod watchdog;
pub mod run;
