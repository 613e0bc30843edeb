pub mod mock_substrate;
