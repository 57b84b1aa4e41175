pub mod bounds;
pub mod vec3;
