pub mod staticegressip;
