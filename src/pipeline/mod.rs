pub mod import;
pub mod extraction;
pub mod strategy;
pub mod material; // Upload/material-store collaborator
pub mod processor; // Material pipeline: fetch → extract → persist
