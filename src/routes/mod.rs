pub mod admin_routes;
