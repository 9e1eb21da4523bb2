pub mod guest;
pub mod msr_bitmap;
pub mod trap_frame;
pub mod vcpu_data;
pub mod vmcs;
pub mod vmxon;
