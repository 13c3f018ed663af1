pub mod alignment;
pub mod astro_util;
pub mod clock;
pub mod clustering;
pub mod command_queue;
pub mod ephemeris;
pub mod frame_rotation;
pub mod image_registration;
pub mod image_utils;
pub mod instruction;
pub mod lx200_driver;
pub mod mount;
pub mod mount_driver;
pub mod settings;
pub mod simulated_camera;
pub mod simulated_mount;
pub mod value_stats;
